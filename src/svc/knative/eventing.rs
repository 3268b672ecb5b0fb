//! # Eventing module
//!
//! This module provide the knative eventing broker and trigger custom
//! resources, the event fabric lambda workloads subscribe to

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::svc::knative::{Addressable, Condition, Destination};

// -----------------------------------------------------------------------------
// Broker structures

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[kube(group = "eventing.knative.dev")]
#[kube(version = "v1")]
#[kube(kind = "Broker")]
#[kube(plural = "brokers")]
#[kube(status = "BrokerStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct BrokerSpec {}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct BrokerStatus {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "address", skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
}

impl Broker {
    /// returns whether the broker ingress accepts events
    pub fn ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| super::ready(&status.conditions))
            .unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Trigger structures

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[kube(group = "eventing.knative.dev")]
#[kube(version = "v1")]
#[kube(kind = "Trigger")]
#[kube(plural = "triggers")]
#[kube(status = "TriggerStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
pub struct TriggerSpec {
    #[serde(rename = "broker")]
    pub broker: String,
    #[serde(rename = "filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<TriggerFilter>,
    #[serde(rename = "subscriber")]
    pub subscriber: Destination,
    #[serde(rename = "delivery", skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct TriggerFilter {
    #[serde(rename = "attributes", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct DeliverySpec {
    #[serde(rename = "deadLetterSink", skip_serializing_if = "Option::is_none")]
    pub dead_letter_sink: Option<Destination>,
    #[serde(rename = "retry", skip_serializing_if = "Option::is_none")]
    pub retry: Option<i32>,
    #[serde(rename = "backoffPolicy", skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<String>,
    #[serde(rename = "backoffDelay", skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct TriggerStatus {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "subscriberUri", skip_serializing_if = "Option::is_none")]
    pub subscriber_uri: Option<String>,
}

impl Trigger {
    /// returns whether the trigger subscription is active on the broker
    pub fn ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| super::ready(&status.conditions))
            .unwrap_or(false)
    }
}
