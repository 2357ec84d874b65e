//! Operator-style status conditions
//!
//! Control-plane objects report state as a list of `{type, status, reason,
//! message}` conditions. A condition that is missing from the list is
//! *absent*: [`find_condition`] returns `None` and nothing here defaults it to
//! `False`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type: the component is functional
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type: the component is rolling out a change
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type: the component is in a bad state
pub const CONDITION_DEGRADED: &str = "Degraded";
/// Condition type: a machine-config pool finished updating
pub const CONDITION_UPDATED: &str = "Updated";
/// Condition type: a machine-config pool is updating
pub const CONDITION_UPDATING: &str = "Updating";
/// Condition type: static-pod installers are rolling out a revision
pub const CONDITION_NODE_INSTALLER_PROGRESSING: &str = "NodeInstallerProgressing";
/// Reason reported once every node runs the latest static-pod revision
pub const REASON_ALL_NODES_AT_LATEST_REVISION: &str = "AllNodesAtLatestRevision";

/// Status value of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Unknown, or any value we do not recognise
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single status condition
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Available, Progressing, ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    #[serde(default)]
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a condition transitioning now
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Set the reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the transition time
    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(at);
        self
    }

    /// True if the status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// True if the status is `False`
    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }
}

/// Find a condition by type. Missing conditions are `None`, never defaulted.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status of a condition, or `None` when the condition is absent
pub fn condition_status(conditions: &[Condition], type_: &str) -> Option<ConditionStatus> {
    find_condition(conditions, type_).map(|c| c.status)
}

/// True only if the condition is present with status `True`
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_true)
}

/// True only if the condition is present with status `False`
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_false)
}
