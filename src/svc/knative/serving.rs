//! # Serving module
//!
//! This module provide the knative serving service custom resource, the
//! scalable runtime workload backing every lambda function and agent

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::svc::knative::{Addressable, Condition, Container};

// -----------------------------------------------------------------------------
// Constants

pub const AUTOSCALING_MIN_SCALE: &str = "autoscaling.knative.dev/min-scale";
pub const AUTOSCALING_MAX_SCALE: &str = "autoscaling.knative.dev/max-scale";
pub const AUTOSCALING_TARGET: &str = "autoscaling.knative.dev/target";

// -----------------------------------------------------------------------------
// Spec structures

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "serving.knative.dev")]
#[kube(version = "v1")]
#[kube(kind = "Service")]
#[kube(plural = "services")]
#[kube(status = "ServiceStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct ServiceSpec {
    #[serde(rename = "template")]
    pub template: RevisionTemplate,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RevisionTemplate {
    #[serde(rename = "metadata", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RevisionMetadata>,
    #[serde(rename = "spec")]
    pub spec: RevisionSpec,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RevisionMetadata {
    #[serde(rename = "annotations", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RevisionSpec {
    #[serde(rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(rename = "containerConcurrency", skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,
    #[serde(rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(rename = "containers")]
    pub containers: Vec<Container>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ServiceStatus {
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "address", skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
    #[serde(rename = "latestReadyRevisionName", skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,
    #[serde(rename = "latestCreatedRevisionName", skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,
    #[serde(rename = "actualReplicas", skip_serializing_if = "Option::is_none")]
    pub actual_replicas: Option<i32>,
}

impl Service {
    /// returns whether the latest created revision is ready to serve traffic
    pub fn ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| super::ready(&status.conditions))
            .unwrap_or(false)
    }
}
