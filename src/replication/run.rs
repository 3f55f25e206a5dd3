//! Replication Run
//!
//! Drives one complete replication pass: refresh the change log caches,
//! drain all current differences through the replicator inside one
//! transaction pair, defer foreign-key casualties for a single second
//! chance, and commit or roll back at the end. Cooperates with the task
//! sweeper so a stalled or timed-out run rolls back instead of committing
//! half-finished work.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::change::LoggedChangeLoaders;
use crate::db::{Session, Side};
use crate::error::{ConstraintViolation, Error, Result};
use crate::heartbeat::Heartbeat;
use crate::sweeper::TaskSweeper;

use super::difference::ReplicationDifference;
use super::helper::ReplicationHelper;
use super::two_way::TwoWayReplicator;

/// A single replication pass over both databases
pub struct ReplicationRun {
    session: Session,
    sweeper: Arc<TaskSweeper>,
    heartbeat: Arc<Heartbeat>,
}

impl ReplicationRun {
    pub fn new(session: Session, sweeper: Arc<TaskSweeper>, heartbeat: Arc<Heartbeat>) -> Self {
        Self {
            session,
            sweeper,
            heartbeat,
        }
    }

    /// Execute the run. Returns silently when there is nothing to do or the
    /// run was cancelled; fails on configuration errors and on fatal
    /// replication errors.
    pub async fn run(&self) -> Result<()> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("replication_run", run_id = %run_id);
        self.execute().instrument(span).await
    }

    async fn execute(&self) -> Result<()> {
        let (_, has_changes) = tokio::join!(
            self.heartbeat.ping(),
            self.session.has_pending_changes()
        );
        if !has_changes? {
            return Ok(());
        }

        // The pending-changes probe alone can outlast the watchdog; when it
        // did, return before any transaction is started.
        if self.sweeper.terminated() {
            return Ok(());
        }

        // Fail fast on invalid handling options, before opening transactions
        TwoWayReplicator::validate_config(&self.session)?;

        let mut loaders = LoggedChangeLoaders::new(&self.session).await?;
        let helper = Arc::new(ReplicationHelper::new(self.session.clone()).await?);
        let replicator = TwoWayReplicator::new(helper.clone())?;

        let result = self.drain(&mut loaders, &helper, &replicator).await;

        if self.sweeper.terminated() {
            // A cancelled run must not commit; drop the connections entirely
            // so no half-open transaction lingers
            if let Err(e) = helper.finalize(false).await {
                tracing::warn!("Rollback after termination failed: {}", e);
            }
            if let Err(e) = self.session.disconnect_databases().await {
                tracing::warn!("Disconnect after termination failed: {}", e);
            }
            return result;
        }

        match &result {
            Ok(()) => helper.finalize(true).await?,
            Err(_) => {
                if let Err(e) = helper.finalize(false).await {
                    tracing::warn!("Rollback after failed run failed: {}", e);
                }
            }
        }
        result
    }

    /// Process batches of differences until the change logs stop growing
    async fn drain(
        &self,
        loaders: &mut LoggedChangeLoaders,
        helper: &Arc<ReplicationHelper>,
        replicator: &TwoWayReplicator,
    ) -> Result<()> {
        let max_attempts = self.session.config().replication.max_attempts;
        let mut second_chancers: VecDeque<ReplicationDifference> = VecDeque::new();

        loop {
            self.heartbeat.ping().await;
            self.sweeper.ping();

            // One batch: everything currently cached, then the second chancers
            loop {
                if self.sweeper.terminated() {
                    return Ok(());
                }
                self.sweeper.ping();

                let mut diff = ReplicationDifference::new();
                diff.load(loaders).await?;
                if !diff.loaded() {
                    match second_chancers.pop_front() {
                        Some(chancer) => diff = chancer,
                        None => break,
                    }
                }

                if self.event_filtered(helper, &diff).await {
                    continue;
                }

                match replicator
                    .replicate_difference(&mut diff, loaders, max_attempts)
                    .await
                {
                    Ok(()) => {}
                    Err(e)
                        if e.constraint_violation() == Some(ConstraintViolation::ForeignKey)
                            && !diff.second_chance =>
                    {
                        // Likely ordering: the row this one references is
                        // replicated later in the same batch. Retry once at
                        // the end of the batch.
                        tracing::debug!(
                            "Deferring difference after foreign key violation: {}",
                            e
                        );
                        diff.second_chance = true;
                        second_chancers.push_back(diff);
                    }
                    Err(e @ Error::MaxReplicationAttempts) => return Err(e),
                    Err(e) => {
                        tracing::warn!("Replication of one difference failed: {}", e);
                        let description = e.to_string();
                        let long_description = format!("{:?}", e);
                        if helper
                            .log_replication_outcome(&diff, &description, &long_description)
                            .await
                            .is_err()
                        {
                            // Never mask the real failure with a logging failure
                            return Err(e);
                        }
                    }
                }
            }

            if self.sweeper.terminated() {
                return Ok(());
            }
            if !loaders.update().await? {
                break;
            }
        }
        Ok(())
    }

    /// Ask the configured event filter whether to skip this difference
    async fn event_filtered(
        &self,
        helper: &ReplicationHelper,
        diff: &ReplicationDifference,
    ) -> bool {
        let change = diff.change(Side::Left);
        let Some(table) = &change.table else {
            return false;
        };
        let Some(name) = helper.options_for_table(table).event_filter else {
            return false;
        };
        let Some(filter) = self.session.handlers().filter(&name) else {
            return false;
        };
        let Some(key) = &change.key else {
            return false;
        };
        !filter.before_replicate(table, key, helper, diff).await
    }
}
