//! # Render module
//!
//! This module provide pure renderers turning a custom resource into the
//! exact desired set of child resources. Renderers take no clients and read
//! no clocks, the same input always produces the same output, which makes
//! the diff-based apply of the deployer idempotent.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::svc::{
    crd::{Eventing, Kind, Observability, Scaling},
    knative::{eventing::Trigger, messaging::Channel, serving::Service, EnvVar, ResourceRequirements},
};

pub mod eventing;
pub mod job;
pub mod rbac;
pub mod service;

// -----------------------------------------------------------------------------
// constants

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "lambda-operator";
pub const KIND_LABEL: &str = "lambda.sh/kind";
pub const NAME_LABEL: &str = "lambda.sh/name";
pub const FINGERPRINT_LABEL: &str = "lambda.sh/fingerprint";

// -----------------------------------------------------------------------------
// Workload structure

/// kind-agnostic renderer input, both custom resources flatten into this
/// before rendering
#[derive(PartialEq, Clone, Debug)]
pub struct Workload {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    /// digest-pinned image reference to run
    pub image: String,
    /// environment overlay handed to the runtime container
    pub env: Vec<EnvVar>,
    pub eventing: Eventing,
    pub scaling: Scaling,
    pub observability: Observability,
    pub timeout_seconds: Option<i64>,
    pub resources: Option<ResourceRequirements>,
    pub broker: String,
    pub owner: OwnerReference,
}

impl Workload {
    /// labels stamped on every child resource of this workload
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (KIND_LABEL.to_string(), self.kind.to_string()),
            (NAME_LABEL.to_string(), self.name.to_owned()),
        ])
    }
}

// -----------------------------------------------------------------------------
// ChildSet structure

/// the complete desired set of child resources for one workload
#[derive(PartialEq, Clone, Debug)]
pub struct ChildSet {
    pub service_account: k8s_openapi::api::core::v1::ServiceAccount,
    pub service: Service,
    pub triggers: Vec<Trigger>,
    pub dlq: Option<Channel>,
}

/// render the full child set of the given workload
pub fn render(workload: &Workload) -> ChildSet {
    let dlq = eventing::dlq(workload);

    ChildSet {
        service_account: rbac::render(workload),
        service: service::render(workload),
        triggers: eventing::triggers(workload, dlq.as_ref()),
        dlq,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::svc::crd::{Kind, Metrics, Observability, Scaling, Tracing};

    use super::*;

    pub fn workload() -> Workload {
        Workload {
            kind: Kind::Function,
            namespace: "default".to_string(),
            name: "hello".to_string(),
            image: "registry.lambda.sh/python@sha256:abcdef".to_string(),
            env: vec![EnvVar {
                name: "LAMBDA_HANDLER".to_string(),
                value: "handler".to_string(),
            }],
            eventing: Eventing {
                subscribed_event_types: vec!["com.example.order.created".to_string()],
                dead_letter: None,
            },
            scaling: Scaling {
                min_replicas: 0,
                max_replicas: 3,
                concurrency_target: 10,
            },
            observability: Observability {
                tracing: Tracing {
                    enabled: false,
                    endpoint: None,
                },
                metrics: Metrics { enabled: true },
            },
            timeout_seconds: Some(30),
            resources: None,
            broker: "default".to_string(),
            owner: OwnerReference {
                api_version: "api.lambda.sh/v1alpha1".to_string(),
                kind: "LambdaFunction".to_string(),
                name: "hello".to_string(),
                uid: "00000000-0000-0000-0000-000000000000".to_string(),
                block_owner_deletion: Some(true),
                controller: Some(true),
            },
        }
    }

    #[test]
    fn render_is_deterministic() {
        let workload = workload();

        let first = serde_json::to_value(render(&workload).service).expect("service to serialize");
        let second = serde_json::to_value(render(&workload).service).expect("service to serialize");

        assert_eq!(first, second);
    }

    #[test]
    fn child_set_matches_declared_event_types() {
        let mut workload = workload();
        workload.eventing.subscribed_event_types = vec![
            "com.example.order.created".to_string(),
            "com.example.order.deleted".to_string(),
        ];

        let children = render(&workload);

        assert_eq!(children.triggers.len(), 2);
        assert!(children.dlq.is_none());
    }
}
