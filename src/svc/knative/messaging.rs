//! # Messaging module
//!
//! This module provide the knative messaging channel custom resource, used as
//! the dead-letter sink of event bindings

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::svc::knative::{eventing::DeliverySpec, Addressable, Condition};

// -----------------------------------------------------------------------------
// Constants

pub const RETENTION_ANNOTATION: &str = "lambda.sh/retention";
pub const REPLAY_CURSOR_ANNOTATION: &str = "lambda.sh/replay-cursor";

// -----------------------------------------------------------------------------
// Channel structures

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[kube(group = "messaging.knative.dev")]
#[kube(version = "v1")]
#[kube(kind = "Channel")]
#[kube(plural = "channels")]
#[kube(status = "ChannelStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct ChannelSpec {
    #[serde(rename = "delivery", skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ChannelStatus {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "address", skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
}
