//! Two-Way Replicator
//!
//! The decision engine: takes one classified `ReplicationDifference` at a
//! time and applies the configured handling (ignore, custom handler, or
//! propagation), resolving conflicts by policy.
//!
//! Replication races with the applications writing to both databases: a row
//! can be created, renamed, or deleted between the moment a difference is
//! loaded and the moment it is applied. Any write that fails in one of the
//! recognized transient ways causes the difference to be re-derived from the
//! current change logs and retried, bounded by the attempts counter.

use std::sync::Arc;

use crate::change::{ChangeType, LoggedChangeLoaders};
use crate::config::{ChangeHandling, ConflictHandling, LoggedEvent};
use crate::db::{Session, Side};
use crate::error::{ConstraintViolation, Error, Result};

use super::difference::{DiffType, ReplicationDifference};
use super::helper::ReplicationHelper;

/// Result of one replication attempt
enum Attempt {
    /// The difference was handled (or intentionally skipped)
    Done,
    /// The database moved under us; re-derive the difference and try again
    Reload,
}

/// Terminal decisions that can be written to the event log
enum Outcome {
    Ignored,
    Replicated,
    Won(Side),
}

/// The two-way replication decision engine
pub struct TwoWayReplicator {
    helper: Arc<ReplicationHelper>,
}

impl TwoWayReplicator {
    /// Create the replicator, validating every configured handling option.
    /// Invalid options fail here, before any difference is touched.
    pub fn new(helper: Arc<ReplicationHelper>) -> Result<Self> {
        Self::validate_config(helper.session())?;
        Ok(Self { helper })
    }

    /// Fail-fast validation of all handling options against the handler
    /// registry. Called by `new`, and early enough in a run to precede any
    /// transaction work.
    pub fn validate_config(session: &Session) -> Result<()> {
        let config = session.config();
        let global = &config.replication;
        let tables = &config.tables;

        Self::verify_change_handling(session, None, "left_change_handling", &global.left_change_handling)?;
        Self::verify_change_handling(session, None, "right_change_handling", &global.right_change_handling)?;
        Self::verify_conflict_handling(
            session,
            None,
            &global.replication_conflict_handling,
        )?;
        Self::verify_event_filter(session, None, global.event_filter.as_deref())?;

        for spec in tables {
            let scope = Some(spec.left.as_str());
            if let Some(handling) = &spec.left_change_handling {
                Self::verify_change_handling(session, scope, "left_change_handling", handling)?;
            }
            if let Some(handling) = &spec.right_change_handling {
                Self::verify_change_handling(session, scope, "right_change_handling", handling)?;
            }
            if let Some(handling) = &spec.replication_conflict_handling {
                Self::verify_conflict_handling(session, scope, handling)?;
            }
            Self::verify_event_filter(session, scope, spec.event_filter.as_deref())?;
        }
        Ok(())
    }

    fn verify_change_handling(
        session: &Session,
        scope: Option<&str>,
        key: &str,
        handling: &ChangeHandling,
    ) -> Result<()> {
        if let ChangeHandling::Custom(name) = handling {
            if session.handlers().handler(name).is_none() {
                return Err(Error::Config(option_error(scope, name, key)));
            }
        }
        Ok(())
    }

    fn verify_conflict_handling(
        session: &Session,
        scope: Option<&str>,
        handling: &ConflictHandling,
    ) -> Result<()> {
        if let ConflictHandling::Custom(name) = handling {
            if session.handlers().handler(name).is_none() {
                return Err(Error::Config(option_error(
                    scope,
                    name,
                    "replication_conflict_handling",
                )));
            }
        }
        Ok(())
    }

    fn verify_event_filter(
        session: &Session,
        scope: Option<&str>,
        filter: Option<&str>,
    ) -> Result<()> {
        if let Some(name) = filter {
            if session.handlers().filter(name).is_none() {
                return Err(Error::Config(option_error(scope, name, "event_filter")));
            }
        }
        Ok(())
    }

    pub fn helper(&self) -> &Arc<ReplicationHelper> {
        &self.helper
    }

    /// Handle one difference, re-deriving and retrying on recognized
    /// transient failures. Fails with `MaxReplicationAttempts` once
    /// `max_attempts` is used up; `max_attempts == 0` fails without
    /// touching anything.
    pub async fn replicate_difference(
        &self,
        diff: &mut ReplicationDifference,
        loaders: &mut LoggedChangeLoaders,
        max_attempts: u32,
    ) -> Result<()> {
        let mut remaining = max_attempts;
        loop {
            if remaining == 0 {
                return Err(Error::MaxReplicationAttempts);
            }
            remaining -= 1;

            match self.attempt(diff).await? {
                Attempt::Done => return Ok(()),
                Attempt::Reload => {
                    tracing::debug!(
                        diff_type = %diff.kind,
                        remaining,
                        "difference raced with a concurrent change, re-deriving"
                    );
                    diff.amend(loaders).await?;
                }
            }
        }
    }

    async fn attempt(&self, diff: &ReplicationDifference) -> Result<Attempt> {
        match diff.kind {
            // Can happen when an amend folded everything away
            DiffType::NoDiff => Ok(Attempt::Done),
            DiffType::Left => self.attempt_change(Side::Left, diff).await,
            DiffType::Right => self.attempt_change(Side::Right, diff).await,
            DiffType::Conflict => self.attempt_conflict(diff).await,
        }
    }

    /// Apply the configured handling for a one-sided change
    async fn attempt_change(&self, source: Side, diff: &ReplicationDifference) -> Result<Attempt> {
        let change = diff.change(source);
        let Some(table) = change.table.clone() else {
            return Ok(Attempt::Done);
        };
        let options = self.helper.options_for_table(&table);
        let handling = match source {
            Side::Left => options.left_change_handling,
            Side::Right => options.right_change_handling,
        };

        match handling {
            ChangeHandling::Ignore => {
                self.log_outcome(Outcome::Ignored, diff).await?;
                Ok(Attempt::Done)
            }
            ChangeHandling::Custom(name) => {
                let key = match source {
                    Side::Left => "left_change_handling",
                    Side::Right => "right_change_handling",
                };
                let handler = self
                    .helper
                    .session()
                    .handlers()
                    .handler(&name)
                    .ok_or_else(|| Error::Config(option_error(Some(&table), &name, key)))?;
                handler.handle(&self.helper, diff).await?;
                Ok(Attempt::Done)
            }
            ChangeHandling::Replicate => self.replicate_change(source, diff).await,
        }
    }

    /// Copy the source change to the target database
    async fn replicate_change(
        &self,
        source: Side,
        diff: &ReplicationDifference,
    ) -> Result<Attempt> {
        let change = diff.change(source);
        let target = source.other();
        let (Some(table), Some(key)) = (change.table.clone(), change.key.clone()) else {
            return Ok(Attempt::Done);
        };
        let target_table = self
            .helper
            .session()
            .config()
            .corresponding_table(source, &table);

        match change.kind {
            ChangeType::NoChange => Ok(Attempt::Done),

            ChangeType::Insert => {
                // Load the row fresh so the latest column values propagate
                let Some(values) = self.helper.load_record(source, &table, &key).await? else {
                    // Source row vanished after the log entry was written
                    return Ok(Attempt::Reload);
                };
                match self.helper.insert_record(target, &target_table, &values).await {
                    Ok(()) => {
                        self.log_outcome(Outcome::Replicated, diff).await?;
                        Ok(Attempt::Done)
                    }
                    Err(e) if e.constraint_violation() == Some(ConstraintViolation::Unique) => {
                        // The row was independently created on the target
                        Ok(Attempt::Reload)
                    }
                    Err(e) => Err(e),
                }
            }

            ChangeType::Update => {
                let source_key = change.new_key.clone().unwrap_or_else(|| key.clone());
                let Some(values) = self.helper.load_record(source, &table, &source_key).await?
                else {
                    return Ok(Attempt::Reload);
                };
                let affected = self
                    .helper
                    .update_record(target, &target_table, &values, &key)
                    .await?;
                if affected == 0 {
                    // Target row vanished
                    Ok(Attempt::Reload)
                } else {
                    self.log_outcome(Outcome::Replicated, diff).await?;
                    Ok(Attempt::Done)
                }
            }

            ChangeType::Delete => {
                let affected = self.helper.delete_record(target, &target_table, &key).await?;
                if affected == 0 {
                    Ok(Attempt::Reload)
                } else {
                    self.log_outcome(Outcome::Replicated, diff).await?;
                    Ok(Attempt::Done)
                }
            }
        }
    }

    /// Resolve a conflict per the configured policy
    async fn attempt_conflict(&self, diff: &ReplicationDifference) -> Result<Attempt> {
        let Some(table) = diff.change(Side::Left).table.clone() else {
            return Ok(Attempt::Done);
        };
        let options = self.helper.options_for_table(&table);

        match options.replication_conflict_handling {
            ConflictHandling::Ignore => {
                self.log_outcome(Outcome::Ignored, diff).await?;
                Ok(Attempt::Done)
            }
            ConflictHandling::Custom(name) => {
                let handler = self
                    .helper
                    .session()
                    .handlers()
                    .handler(&name)
                    .ok_or_else(|| {
                        Error::Config(option_error(
                            Some(&table),
                            &name,
                            "replication_conflict_handling",
                        ))
                    })?;
                handler.handle(&self.helper, diff).await?;
                Ok(Attempt::Done)
            }
            ConflictHandling::LeftWins => self.clear_conflict(Side::Left, diff).await,
            ConflictHandling::RightWins => self.clear_conflict(Side::Right, diff).await,
            ConflictHandling::LaterWins => {
                let winner = match (
                    diff.change(Side::Left).last_changed_at,
                    diff.change(Side::Right).last_changed_at,
                ) {
                    (Some(left), Some(right)) if right > left => Side::Right,
                    _ => Side::Left,
                };
                self.clear_conflict(winner, diff).await
            }
            ConflictHandling::EarlierWins => {
                let winner = match (
                    diff.change(Side::Left).last_changed_at,
                    diff.change(Side::Right).last_changed_at,
                ) {
                    (Some(left), Some(right)) if right < left => Side::Right,
                    _ => Side::Left,
                };
                self.clear_conflict(winner, diff).await
            }
        }
    }

    /// Apply the winning side's change to the other database
    async fn clear_conflict(&self, winner: Side, diff: &ReplicationDifference) -> Result<Attempt> {
        let source_change = diff.change(winner);
        let target_side = winner.other();
        let target_change = diff.change(target_side);

        let (Some(source_table), Some(source_key)) =
            (source_change.table.clone(), source_change.key.clone())
        else {
            return Ok(Attempt::Done);
        };
        let target_table = target_change.table.clone().unwrap_or_else(|| {
            self.helper
                .session()
                .config()
                .corresponding_table(winner, &source_table)
        });
        // The target row currently lives under the target side's latest key
        let target_key = target_change
            .new_key
            .clone()
            .or_else(|| target_change.key.clone())
            .unwrap_or_else(|| source_key.clone());

        match source_change.kind {
            ChangeType::NoChange => Ok(Attempt::Done),

            ChangeType::Insert | ChangeType::Update => {
                let load_key = source_change
                    .new_key
                    .clone()
                    .unwrap_or_else(|| source_key.clone());
                let Some(values) = self
                    .helper
                    .load_record(winner, &source_table, &load_key)
                    .await?
                else {
                    return Ok(Attempt::Reload);
                };

                if target_change.kind == ChangeType::Delete {
                    // The loser deleted the row, so the winner's version is
                    // reinstated with an insert
                    match self
                        .helper
                        .insert_record(target_side, &target_table, &values)
                        .await
                    {
                        Ok(()) => {
                            self.log_outcome(Outcome::Won(winner), diff).await?;
                            Ok(Attempt::Done)
                        }
                        Err(e)
                            if e.constraint_violation() == Some(ConstraintViolation::Unique) =>
                        {
                            Ok(Attempt::Reload)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    let affected = self
                        .helper
                        .update_record(target_side, &target_table, &values, &target_key)
                        .await?;
                    if affected == 0 {
                        Ok(Attempt::Reload)
                    } else {
                        self.log_outcome(Outcome::Won(winner), diff).await?;
                        Ok(Attempt::Done)
                    }
                }
            }

            ChangeType::Delete => {
                if target_change.kind == ChangeType::Delete {
                    // Both sides already deleted the row; nothing to write
                    self.log_outcome(Outcome::Won(winner), diff).await?;
                    return Ok(Attempt::Done);
                }
                let affected = self
                    .helper
                    .delete_record(target_side, &target_table, &target_key)
                    .await?;
                if affected == 0 {
                    Ok(Attempt::Reload)
                } else {
                    self.log_outcome(Outcome::Won(winner), diff).await?;
                    Ok(Attempt::Done)
                }
            }
        }
    }

    /// Write the outcome to the event log if the table's
    /// `logged_replication_events` ask for it
    async fn log_outcome(&self, outcome: Outcome, diff: &ReplicationDifference) -> Result<()> {
        let change = if diff.change(Side::Left).table.is_some() {
            diff.change(Side::Left)
        } else {
            diff.change(Side::Right)
        };
        let Some(table) = change.table.clone() else {
            return Ok(());
        };
        let events = self
            .helper
            .options_for_table(&table)
            .logged_replication_events;
        let contains = |event: LoggedEvent| events.contains(&event);

        let entry = if diff.kind == DiffType::Conflict {
            match outcome {
                Outcome::Ignored
                    if contains(LoggedEvent::IgnoredConflicts)
                        || contains(LoggedEvent::AllConflicts) =>
                {
                    Some(("ignored", "conflict ignored".to_string()))
                }
                Outcome::Won(winner) if contains(LoggedEvent::AllConflicts) => match winner {
                    Side::Left => Some(("left_won", "left change applied to right database".to_string())),
                    Side::Right => Some(("right_won", "right change applied to left database".to_string())),
                },
                _ => None,
            }
        } else {
            match outcome {
                Outcome::Ignored
                    if contains(LoggedEvent::IgnoredChanges)
                        || contains(LoggedEvent::AllChanges) =>
                {
                    Some(("ignored", "change ignored".to_string()))
                }
                Outcome::Replicated if contains(LoggedEvent::AllChanges) => {
                    let target = diff
                        .kind
                        .source_side()
                        .map(|side| side.other().as_str())
                        .unwrap_or("other");
                    Some((
                        "replicated",
                        format!("{} change applied to {} database", diff.kind, target),
                    ))
                }
                _ => None,
            }
        };

        if let Some((description, long_description)) = entry {
            self.helper
                .log_replication_outcome(diff, description, &long_description)
                .await?;
        }
        Ok(())
    }
}

fn option_error(scope: Option<&str>, value: &str, key: &str) -> String {
    match scope {
        Some(table) => format!("table '{table}': '{value}' is not a valid {key} option"),
        None => format!("'{value}' is not a valid {key} option"),
    }
}
