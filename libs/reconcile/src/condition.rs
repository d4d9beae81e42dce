//! Ordered condition history with replace-by-type semantics.
//!
//! Setting a condition removes any existing entry of the same type and
//! appends the new one, so the relative order of the other types is kept
//! and the last entry always names the most recent phase.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// Boolean status of a condition, serialized the way Kubernetes does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A single typed entry in a resource's condition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    /// Type of the condition.
    #[serde(rename = "type")]
    pub type_: T,

    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    /// Human-readable detail about the last write.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// The last time this condition was written.
    pub last_update_time: DateTime<Utc>,

    /// The last time the status flipped.
    pub last_transition_time: DateTime<Utc>,
}

impl<T> Condition<T> {
    pub fn is_true(&self) -> bool {
        self.status.is_true()
    }
}

/// Ordered condition history keyed by condition type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConditionLedger<T>(Vec<Condition<T>>);

impl<T> Default for ConditionLedger<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Copy + Eq> ConditionLedger<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a condition stamped with the current time.
    ///
    /// Returns false when the call was absorbed: the condition is already the
    /// latest entry with the same status and message, so writing it again
    /// would only bump `last_update_time`.
    pub fn set(&mut self, type_: T, status: impl Into<ConditionStatus>, message: impl Into<String>) -> bool {
        self.set_at(type_, status, message, Utc::now())
    }

    /// Set a condition stamped with `now`.
    pub fn set_at(
        &mut self,
        type_: T,
        status: impl Into<ConditionStatus>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let status = status.into();
        let message = message.into();

        if let Some(last) = self.0.last() {
            if last.type_ == type_ && last.status == status && last.message == message {
                return false;
            }
        }

        let mut candidate = Condition {
            type_,
            status,
            message,
            last_update_time: now,
            last_transition_time: now,
        };

        if let Some(existing) = self.get(type_) {
            if existing.status == candidate.status {
                candidate.last_transition_time = existing.last_transition_time;
            }
        }

        self.0.retain(|c| c.type_ != type_);
        self.0.push(candidate);
        true
    }

    /// Look up the condition of a given type.
    pub fn get(&self, type_: T) -> Option<&Condition<T>> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// True iff a condition of this type exists with status True.
    pub fn has(&self, type_: T) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// Type of the most recently written condition.
    pub fn last_type(&self) -> Result<T, ReconcileError> {
        self.0.last().map(|c| c.type_).ok_or(ReconcileError::NoCondition)
    }

    /// Most recently written condition.
    pub fn last(&self) -> Option<&Condition<T>> {
        self.0.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition<T>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
