//! Replication Differences
//!
//! A `ReplicationDifference` pairs the left and right logged changes for one
//! logical record and classifies the pair. Loading claims the globally
//! oldest pending change, then pulls the counterpart change for the same
//! record from the other side so overlapping changes are always considered
//! together.

use crate::change::{ChangeType, LoggedChange, LoggedChangeLoaders};
use crate::db::Side;
use crate::error::Result;

/// Classification of a left/right change pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Nothing to replicate (also the state before `load`)
    NoDiff,
    /// Only the left database changed
    Left,
    /// Only the right database changed
    Right,
    /// Both databases changed the same record
    Conflict,
}

impl DiffType {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffType::NoDiff => "no_diff",
            DiffType::Left => "left",
            DiffType::Right => "right",
            DiffType::Conflict => "conflict",
        }
    }

    /// The originating side for one-sided differences
    pub fn source_side(self) -> Option<Side> {
        match self {
            DiffType::Left => Some(Side::Left),
            DiffType::Right => Some(Side::Right),
            _ => None,
        }
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The left/right pair of logged changes for one logical record
#[derive(Debug, Clone)]
pub struct ReplicationDifference {
    pub kind: DiffType,
    left: LoggedChange,
    right: LoggedChange,
    /// Set when the difference failed on a foreign key violation and is
    /// queued for its single deferred retry
    pub second_chance: bool,
}

impl Default for ReplicationDifference {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationDifference {
    pub fn new() -> Self {
        Self {
            kind: DiffType::NoDiff,
            left: LoggedChange::new(Side::Left),
            right: LoggedChange::new(Side::Right),
            second_chance: false,
        }
    }

    pub fn change(&self, side: Side) -> &LoggedChange {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn change_mut(&mut self, side: Side) -> &mut LoggedChange {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Whether `load` found something to replicate
    pub fn loaded(&self) -> bool {
        self.kind != DiffType::NoDiff
    }

    /// Claim the next difference: load the oldest pending change across both
    /// databases, then the counterpart change for the same record from the
    /// other side, and classify the pair.
    pub async fn load(&mut self, loaders: &mut LoggedChangeLoaders) -> Result<()> {
        let oldest_side = match (
            loaders.left.oldest_change_time(),
            loaders.right.oldest_change_time(),
        ) {
            (None, None) => {
                self.kind = DiffType::NoDiff;
                return Ok(());
            }
            (Some(_), None) => Side::Left,
            (None, Some(_)) => Side::Right,
            (Some(left), Some(right)) => {
                if left <= right {
                    Side::Left
                } else {
                    Side::Right
                }
            }
        };

        self.change_mut(oldest_side)
            .load_oldest(loaders.get_mut(oldest_side))
            .await?;

        let source = self.change(oldest_side);
        if source.kind == ChangeType::NoChange {
            // Everything pending folded away to nothing
            self.kind = DiffType::NoDiff;
            return Ok(());
        }
        let (Some(table), Some(key)) = (source.table.clone(), source.key.clone()) else {
            self.kind = DiffType::NoDiff;
            return Ok(());
        };

        let other = oldest_side.other();
        let other_table = loaders
            .get(other)
            .config()
            .corresponding_table(oldest_side, &table);
        self.change_mut(other)
            .load_specified(loaders.get_mut(other), &other_table, key)
            .await?;

        self.kind = self.classify();
        Ok(())
    }

    /// Re-derive the current state of this difference: refresh the change
    /// log caches, fold in any raw rows that arrived since the original
    /// load, and re-classify.
    pub async fn amend(&mut self, loaders: &mut LoggedChangeLoaders) -> Result<()> {
        loaders.update().await?;
        self.left.load(&mut loaders.left).await?;
        self.right.load(&mut loaders.right).await?;
        self.kind = self.classify();
        Ok(())
    }

    fn classify(&self) -> DiffType {
        match (
            self.left.kind != ChangeType::NoChange,
            self.right.kind != ChangeType::NoChange,
        ) {
            (false, false) => DiffType::NoDiff,
            (true, false) => DiffType::Left,
            (false, true) => DiffType::Right,
            (true, true) => DiffType::Conflict,
        }
    }
}
