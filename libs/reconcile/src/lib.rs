//! Reconciliation primitives shared by the cadence controllers.
//!
//! - **Condition ledger**: the ordered, typed condition history every
//!   custom resource carries in its status. The last entry is the resource's
//!   current phase.
//! - **Requeue backoff**: per-key exponential delay used when a reconcile
//!   fails and the key goes back on the work queue.
//!
//! # Invariants
//!
//! - A ledger holds at most one condition per type
//! - `last_transition_time` only moves when a type's status flips
//! - All operations are idempotent under replay

mod backoff;
mod condition;

use std::time::Duration;

use thiserror::Error;

pub use backoff::RequeueBackoff;
pub use condition::{Condition, ConditionLedger, ConditionStatus};

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The condition history is empty, so there is no current phase.
    #[error("resource doesn't have any condition")]
    NoCondition,
}

/// Default interval at which non-terminal resources are reconciled again.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// First requeue delay after a failed reconcile.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for the requeue delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);
