//! Custom resources served by the cadence controllers.
//!
//! Two kinds live in the `cadence.io/v1alpha1` group:
//!
//! - [`Inference`]: one serving workload under evaluation, together with the
//!   load job that measures it.
//! - [`SchedulingDecision`]: a campaign that stamps out Inferences from a
//!   template, asking an external algorithm service where to place each one.
//!
//! Both carry a [`ConditionLedger`](cadence_reconcile::ConditionLedger) in
//! their status whose last entry is the current phase.

pub mod inference;
pub mod metrics;
pub mod scheduling;

pub use inference::{
    Domain, Inference, InferenceConditionType, InferenceSpec, InferenceStatus, ServingSpec,
    ServingStatus,
};
pub use metrics::{MetricCategory, MonitoringResult, NodeMetric, PodMetric, UnknownCategory};
pub use scheduling::{
    AlgorithmSetting, AlgorithmSpec, Objective, ObjectiveType, ResourceAssignment,
    SchedulingConditionType, SchedulingDecision, SchedulingDecisionSpec, SchedulingDecisionStatus,
    SchedulingResult,
};

/// API group of every cadence resource.
pub const GROUP: &str = "cadence.io";

/// Label carried by every object owned by an Inference.
pub const INFERENCE_LABEL: &str = "inference";

/// Label selecting the serving pods of an Inference.
pub const DEPLOYMENT_LABEL: &str = "deployment";

/// Label carried by every Inference stamped out by a campaign.
pub const CAMPAIGN_LABEL: &str = "scheduling-decision";

/// Annotation naming the owner of a child object.
pub const OWNER_ANNOTATION: &str = "cadence.io/owner";

/// Annotation that asks the controller to kill a running Inference.
pub const KILL_ANNOTATION: &str = "cadence.io/kill-requested";

/// Port the inference service listens on.
pub const INFERENCE_SERVICE_PORT: i32 = 8500;

/// Name of the inference service port.
pub const INFERENCE_SERVICE_PORT_NAME: &str = "inference-service";

/// Port the serving containers listen on.
pub const INFERENCE_CONTAINER_PORT: i32 = 8300;

/// Sentinel recorded for a metric that was never observed.
pub const DEFAULT_METRIC_VALUE: &str = "0.0";
