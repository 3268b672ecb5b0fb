//! # Custom resource definition module
//!
//! This module provide custom resource definitions managed by the operator,
//! their shared structures, status schema and validation rules.

use std::fmt::{self, Display, Formatter};

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod agent;
pub mod function;

// -----------------------------------------------------------------------------
// Kind enumeration

/// tagged variant to discriminate the two custom resource kinds in labels,
/// metrics and rendered child resources
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Kind {
    Function,
    Agent,
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Function => write!(f, "LambdaFunction"),
            Self::Agent => write!(f, "LambdaAgent"),
        }
    }
}

// -----------------------------------------------------------------------------
// Language enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Language {
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "node")]
    Node,
    #[serde(rename = "go")]
    Go,
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::Node => write!(f, "node"),
            Self::Go => write!(f, "go"),
        }
    }
}

// -----------------------------------------------------------------------------
// Eventing structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Eventing {
    #[serde(rename = "subscribedEventTypes", default)]
    pub subscribed_event_types: Vec<String>,
    #[serde(rename = "deadLetter", skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterPolicy>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct DeadLetterPolicy {
    #[serde(rename = "retention")]
    pub retention: String,
    #[serde(rename = "maxDeliveries")]
    pub max_deliveries: i32,
}

// -----------------------------------------------------------------------------
// Scaling structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Scaling {
    #[serde(rename = "minReplicas")]
    pub min_replicas: i32,
    #[serde(rename = "maxReplicas")]
    pub max_replicas: i32,
    #[serde(rename = "concurrencyTarget")]
    pub concurrency_target: i32,
}

// -----------------------------------------------------------------------------
// Observability structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Observability {
    #[serde(rename = "tracing", default)]
    pub tracing: Tracing,
    #[serde(rename = "metrics", default)]
    pub metrics: Metrics,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Tracing {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "endpoint", skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Metrics {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
}

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Phase {
    #[default]
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
    Terminating,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Building => write!(f, "Building"),
            Self::Deploying => write!(f, "Deploying"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

// -----------------------------------------------------------------------------
// Condition structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConditionType {
    Built,
    Deployed,
    EventsBound,
    Healthy,
}

impl Display for ConditionType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Built => write!(f, "Built"),
            Self::Deployed => write!(f, "Deployed"),
            Self::EventsBound => write!(f, "EventsBound"),
            Self::Healthy => write!(f, "Healthy"),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
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

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Condition {
    #[serde(rename = "type")]
    pub r#type: ConditionType,
    #[serde(rename = "status")]
    pub status: ConditionStatus,
    #[serde(rename = "reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

// -----------------------------------------------------------------------------
// LastError structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ErrorKind {
    ValidationError,
    SourceFetchError,
    BuildError,
    DeployError,
    EventBindingError,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ValidationError => write!(f, "ValidationError"),
            Self::SourceFetchError => write!(f, "SourceFetchError"),
            Self::BuildError => write!(f, "BuildError"),
            Self::DeployError => write!(f, "DeployError"),
            Self::EventBindingError => write!(f, "EventBindingError"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct LastError {
    #[serde(rename = "kind")]
    pub kind: ErrorKind,
    #[serde(rename = "message")]
    pub message: String,
    #[serde(rename = "at")]
    pub at: String,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(rename = "phase", default)]
    pub phase: Phase,
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(rename = "imageDigest", skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(rename = "replicaCount", skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,
}

impl Status {
    /// upsert the condition of the given type, refreshing the transition time
    /// only when the status actually changes
    pub fn set_condition(
        &mut self,
        r#type: ConditionType,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
    ) {
        let reason = reason.map(String::from);
        let message = message.map(String::from);

        if let Some(condition) = self.conditions.iter_mut().find(|c| c.r#type == r#type) {
            if condition.status != status {
                condition.last_transition_time = now();
            }

            condition.status = status;
            condition.reason = reason;
            condition.message = message;
            return;
        }

        self.conditions.push(Condition {
            r#type,
            status,
            reason,
            message,
            last_transition_time: now(),
        });
    }

    pub fn condition(&self, r#type: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    pub fn set_error(&mut self, kind: ErrorKind, message: &str) {
        self.last_error = Some(LastError {
            kind,
            message: message.to_string(),
            at: now(),
        });
    }
}

/// current time serialized the way kubernetes serializes metadata timestamps
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// -----------------------------------------------------------------------------
// Validation

pub const TIMEOUT_SECONDS_MIN: i64 = 1;
pub const TIMEOUT_SECONDS_MAX: i64 = 900;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source must define exactly one of 'inline' or 'objectRef', both are set")]
    ConflictingSource,
    #[error("source must define exactly one of 'inline' or 'objectRef', none is set")]
    MissingSource,
    #[error("source variant '{0}' does not match its declared type '{1}'")]
    SourceTypeMismatch(String, String),
    #[error("scaling requires 'maxReplicas' ({max}) to be greater than or equal to 'minReplicas' ({min})")]
    ScalingBounds { min: i32, max: i32 },
    #[error("scaling requires 'minReplicas' to be positive, got {0}")]
    NegativeMinReplicas(i32),
    #[error("scaling requires 'concurrencyTarget' to be strictly positive, got {0}")]
    ConcurrencyTarget(i32),
    #[error("runtime requires 'timeoutSeconds' to be within [{TIMEOUT_SECONDS_MIN}, {TIMEOUT_SECONDS_MAX}], got {0}")]
    TimeoutOutOfRange(i64),
    #[error("image requires a non-empty 'repository'")]
    EmptyImageRepository,
}

/// validate the scaling block shared by both custom resource kinds
pub fn validate_scaling(scaling: &Scaling) -> Result<(), ValidationError> {
    if scaling.min_replicas < 0 {
        return Err(ValidationError::NegativeMinReplicas(scaling.min_replicas));
    }

    if scaling.max_replicas < scaling.min_replicas {
        return Err(ValidationError::ScalingBounds {
            min: scaling.min_replicas,
            max: scaling.max_replicas,
        });
    }

    if scaling.concurrency_target <= 0 {
        return Err(ValidationError::ConcurrencyTarget(
            scaling.concurrency_target,
        ));
    }

    Ok(())
}

/// validate the execution timeout shared by both custom resource kinds
pub fn validate_timeout(timeout_seconds: i64) -> Result<(), ValidationError> {
    if !(TIMEOUT_SECONDS_MIN..=TIMEOUT_SECONDS_MAX).contains(&timeout_seconds) {
        return Err(ValidationError::TimeoutOutOfRange(timeout_seconds));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaling(min: i32, max: i32, target: i32) -> Scaling {
        Scaling {
            min_replicas: min,
            max_replicas: max,
            concurrency_target: target,
        }
    }

    #[test]
    fn scale_to_zero_is_allowed() {
        assert!(validate_scaling(&scaling(0, 3, 10)).is_ok());
    }

    #[test]
    fn inverted_replica_bounds_are_rejected() {
        assert_eq!(
            validate_scaling(&scaling(3, 1, 10)),
            Err(ValidationError::ScalingBounds { min: 3, max: 1 })
        );
    }

    #[test]
    fn zero_concurrency_target_is_rejected() {
        assert_eq!(
            validate_scaling(&scaling(0, 1, 0)),
            Err(ValidationError::ConcurrencyTarget(0))
        );
    }

    #[test]
    fn timeout_bounds_are_inclusive() {
        assert!(validate_timeout(TIMEOUT_SECONDS_MIN).is_ok());
        assert!(validate_timeout(TIMEOUT_SECONDS_MAX).is_ok());
        assert_eq!(
            validate_timeout(0),
            Err(ValidationError::TimeoutOutOfRange(0))
        );
        assert_eq!(
            validate_timeout(901),
            Err(ValidationError::TimeoutOutOfRange(901))
        );
    }

    #[test]
    fn condition_transition_time_only_moves_on_status_change() {
        let mut status = Status::default();

        status.set_condition(ConditionType::Built, ConditionStatus::False, None, None);
        let first = status
            .condition(ConditionType::Built)
            .expect("condition to exist")
            .last_transition_time
            .to_owned();

        status.set_condition(
            ConditionType::Built,
            ConditionStatus::False,
            Some("BuildRunning"),
            None,
        );

        let condition = status
            .condition(ConditionType::Built)
            .expect("condition to exist");

        assert_eq!(condition.last_transition_time, first);
        assert_eq!(condition.reason.as_deref(), Some("BuildRunning"));
    }
}
