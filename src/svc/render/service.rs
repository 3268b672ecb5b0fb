//! # Service renderer module
//!
//! This module renders the knative serving service backing a workload, the
//! runtime service of the custom resource

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::svc::{
    knative::serving::{
        RevisionMetadata, RevisionSpec, RevisionTemplate, Service, ServiceSpec,
        AUTOSCALING_MAX_SCALE, AUTOSCALING_MIN_SCALE, AUTOSCALING_TARGET,
    },
    knative::{Container, EnvVar},
    render::{rbac, Workload},
};

// -----------------------------------------------------------------------------
// Helper functions

/// render the runtime service of the given workload, the image is pinned by
/// digest so a superseded fingerprint never leaks into a running revision
pub fn render(workload: &Workload) -> Service {
    let mut env = workload.env.to_owned();

    if workload.observability.tracing.enabled {
        if let Some(endpoint) = &workload.observability.tracing.endpoint {
            env.push(EnvVar {
                name: "OTEL_EXPORTER_OTLP_ENDPOINT".to_string(),
                value: endpoint.to_owned(),
            });
        }
    }

    Service {
        metadata: ObjectMeta {
            name: Some(workload.name.to_owned()),
            namespace: Some(workload.namespace.to_owned()),
            labels: Some(workload.labels()),
            owner_references: Some(vec![workload.owner.to_owned()]),
            ..Default::default()
        },
        spec: ServiceSpec {
            template: RevisionTemplate {
                metadata: Some(RevisionMetadata {
                    annotations: annotations(workload),
                }),
                spec: RevisionSpec {
                    service_account_name: Some(rbac::name(workload)),
                    container_concurrency: Some(workload.scaling.concurrency_target as i64),
                    timeout_seconds: workload.timeout_seconds,
                    containers: vec![Container {
                        image: workload.image.to_owned(),
                        env,
                        resources: workload.resources.to_owned(),
                    }],
                },
            },
        },
        status: None,
    }
}

/// autoscaling annotations understood by the knative autoscaler
fn annotations(workload: &Workload) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            AUTOSCALING_MIN_SCALE.to_string(),
            workload.scaling.min_replicas.to_string(),
        ),
        (
            AUTOSCALING_MAX_SCALE.to_string(),
            workload.scaling.max_replicas.to_string(),
        ),
        (
            AUTOSCALING_TARGET.to_string(),
            workload.scaling.concurrency_target.to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use crate::svc::render::tests::workload;

    use super::*;

    #[test]
    fn service_pins_image_and_scaling() {
        let workload = workload();
        let service = render(&workload);

        assert_eq!(
            service.spec.template.spec.containers[0].image,
            workload.image
        );

        let annotations = service
            .spec
            .template
            .metadata
            .expect("revision template to carry metadata")
            .annotations;

        assert_eq!(annotations.get(AUTOSCALING_MIN_SCALE).map(String::as_str), Some("0"));
        assert_eq!(annotations.get(AUTOSCALING_MAX_SCALE).map(String::as_str), Some("3"));
        assert_eq!(annotations.get(AUTOSCALING_TARGET).map(String::as_str), Some("10"));
    }

    #[test]
    fn service_is_owned_by_the_custom_resource() {
        let service = render(&workload());

        let owners = service
            .metadata
            .owner_references
            .expect("service to carry an owner reference");

        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "LambdaFunction");
    }

    #[test]
    fn tracing_endpoint_lands_in_the_environment() {
        let mut workload = workload();
        workload.observability.tracing.enabled = true;
        workload.observability.tracing.endpoint = Some("http://jaeger:4317".to_string());

        let service = render(&workload);
        let env = &service.spec.template.spec.containers[0].env;

        assert!(env
            .iter()
            .any(|var| var.name == "OTEL_EXPORTER_OTLP_ENDPOINT" && var.value == "http://jaeger:4317"));
    }
}
