//! cadence controller
//!
//! Two reconcilers drive the cadence custom resources:
//!
//! - [`InferenceEngine`] converges one `Inference` through
//!   Service → Deployment → load Job and folds the measured metrics into its
//!   status.
//! - [`CampaignEngine`] keeps a `SchedulingDecision` stamping out Inferences
//!   placed by the external scheduling service until the campaign is done.
//!
//! Both go through [`ClusterApi`] for every cluster read and write, persist
//! status once per reconcile and only when it changed, and treat a stale
//! status write as something the next reconcile corrects.

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod inference;
pub mod planner;
pub mod registry;
pub mod scheduling;
pub mod testing;

pub use cluster::{ClusterApi, ClusterError, ClusterEvent, EventKind, KubeCluster};
pub use config::Config;
pub use context::ControllerContext;
pub use error::{Error, Result};
pub use inference::InferenceEngine;
pub use registry::ControllerRegistry;
pub use scheduling::{CampaignEngine, SchedulingClient, SchedulingError};

/// Name the controller reports events under.
pub const CONTROLLER_NAME: &str = "cadence-controller";

/// What a reconcile left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object is gone; nothing to do.
    NotFound,
    /// Still converging; reconcile again after the resync interval.
    Active,
    /// Finished; only a change to the object brings it back.
    Terminal,
}

/// Event reasons.
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const JOB_SUCCEEDED: &str = "JobSucceeded";
    pub const JOB_FAILED: &str = "JobFailed";
    pub const SERVICE_FAILED: &str = "ServiceFailed";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const KILLED: &str = "Killed";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const SCHEDULING_COMPLETED: &str = "SchedulingCompleted";
}
