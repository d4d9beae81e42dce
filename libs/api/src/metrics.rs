//! Monitoring results reported for an Inference.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed vocabulary of observed metric categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MetricCategory {
    Cpu,
    Memory,
    CompletionTime,
    Environment,
    Arguments,
    Count,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::CompletionTime => "completion-time",
            Self::Environment => "environment",
            Self::Arguments => "arguments",
            Self::Count => "count",
        }
    }

    /// Categories recorded for every pod when no observation exists.
    pub const POD_DEFAULTS: [MetricCategory; 3] = [Self::Cpu, Self::Memory, Self::CompletionTime];

    /// Categories recorded for every candidate node when no observation exists.
    pub const NODE_DEFAULTS: [MetricCategory; 2] = [Self::Cpu, Self::Memory];
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for MetricCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" | "mem" => Ok(Self::Memory),
            "completion-time" | "jct" => Ok(Self::CompletionTime),
            "environment" => Ok(Self::Environment),
            "arguments" => Ok(Self::Arguments),
            "count" => Ok(Self::Count),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// A metric observed for one serving pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodMetric {
    pub pod_name: String,
    pub category: MetricCategory,
    pub value: String,
}

/// A metric observed for one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetric {
    pub node_name: String,
    pub category: MetricCategory,
    pub value: String,
}

/// Flat snapshot of what was observed while an Inference ran.
///
/// Values are opaque strings; parsing them is left to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_metrics: Vec<PodMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_metrics: Vec<NodeMetric>,
}

impl MonitoringResult {
    /// Default-valued result: one row per pod category for `pod_name` and
    /// one row per node category for every node in `nodes`.
    pub fn sentinel<S: AsRef<str>>(pod_name: &str, nodes: &[S], value: &str) -> Self {
        let pod_metrics = MetricCategory::POD_DEFAULTS
            .iter()
            .map(|category| PodMetric {
                pod_name: pod_name.to_string(),
                category: *category,
                value: value.to_string(),
            })
            .collect();

        let node_metrics = nodes
            .iter()
            .flat_map(|node| {
                MetricCategory::NODE_DEFAULTS.iter().map(move |category| NodeMetric {
                    node_name: node.as_ref().to_string(),
                    category: *category,
                    value: value.to_string(),
                })
            })
            .collect();

        Self {
            pod_metrics,
            node_metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pod_metrics.is_empty() && self.node_metrics.is_empty()
    }

    /// Value recorded for a pod and category, if any.
    pub fn pod_value(&self, pod_name: &str, category: MetricCategory) -> Option<&str> {
        self.pod_metrics
            .iter()
            .find(|m| m.pod_name == pod_name && m.category == category)
            .map(|m| m.value.as_str())
    }
}
