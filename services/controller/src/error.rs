use cadence_metrics_store::StorageError;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::scheduling::SchedulingError;

/// Errors a reconcile returns. Every variant requeues the key with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// Children cannot be owned by an object the API server has not stored yet.
    #[error("{kind} {name} has no uid")]
    MissingUid { kind: &'static str, name: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
