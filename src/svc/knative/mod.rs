//! # Knative module
//!
//! This module provide typed definitions for the knative custom resources the
//! operator creates and watches, serving services, eventing triggers and
//! messaging channels. Only the subset of their schemas the operator reads or
//! writes is modelled.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod eventing;
pub mod messaging;
pub mod serving;

// -----------------------------------------------------------------------------
// Condition structure

/// condition shape shared by every knative resource status
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Condition {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(rename = "status")]
    pub status: String,
    #[serde(rename = "reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// returns whether the 'Ready' condition of the given set is true
pub fn ready(conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .any(|condition| condition.r#type == "Ready" && condition.status == "True")
}

/// returns the reason attached to the 'Ready' condition, if any
pub fn ready_reason(conditions: &[Condition]) -> Option<String> {
    conditions
        .iter()
        .find(|condition| condition.r#type == "Ready")
        .and_then(|condition| condition.reason.to_owned())
}

// -----------------------------------------------------------------------------
// Addressable structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Addressable {
    #[serde(rename = "url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// -----------------------------------------------------------------------------
// Destination structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Reference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Destination {
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<Reference>,
    #[serde(rename = "uri", skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

// -----------------------------------------------------------------------------
// Container structures
//
// the pod schema fragment embedded in a serving service revision template,
// kept local so the generated custom resource schemas stay self-contained

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct EnvVar {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "value")]
    pub value: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ResourceRequirements {
    #[serde(rename = "requests", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub requests: BTreeMap<String, String>,
    #[serde(rename = "limits", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub limits: BTreeMap<String, String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Container {
    #[serde(rename = "image")]
    pub image: String,
    #[serde(rename = "env", skip_serializing_if = "Vec::is_empty", default)]
    pub env: Vec<EnvVar>,
    #[serde(rename = "resources", skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_a_true_ready_condition() {
        let conditions = vec![
            Condition {
                r#type: "ConfigurationsReady".to_string(),
                status: "True".to_string(),
                ..Default::default()
            },
            Condition {
                r#type: "Ready".to_string(),
                status: "False".to_string(),
                reason: Some("RevisionMissing".to_string()),
                ..Default::default()
            },
        ];

        assert!(!ready(&conditions));
        assert_eq!(ready_reason(&conditions).as_deref(), Some("RevisionMissing"));
    }

    #[test]
    fn ready_on_empty_conditions_is_false() {
        assert!(!ready(&[]));
    }
}
