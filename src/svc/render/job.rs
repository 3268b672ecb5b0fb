//! # Job renderer module
//!
//! This module renders the in-cluster image build job of a function
//! fingerprint, a kaniko-style builder pulling its context from the object
//! storage and pushing the produced image to the configured registry

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
};
use kube::api::ObjectMeta;

use crate::svc::{
    build::fingerprint::Fingerprint,
    cfg::Configuration,
    crd::Language,
    render::{FINGERPRINT_LABEL, MANAGED_BY, MANAGED_BY_LABEL},
};

// -----------------------------------------------------------------------------
// Helper functions

/// name of the build job of the given fingerprint, shortened to stay well
/// under the resource name length limit
pub fn name(fingerprint: &Fingerprint) -> String {
    format!("build-{}", fingerprint.short())
}

/// image reference the builder pushes for the given fingerprint
pub fn destination(config: &Configuration, language: Language, fingerprint: &Fingerprint) -> String {
    format!("{}/{}:{}", config.build.registry, language, fingerprint)
}

/// render the build job of the given fingerprint. The job is operator-owned
/// and shared by every custom resource with the same fingerprint, its label
/// is the cluster-visible build lock
pub fn render(
    config: &Configuration,
    language: Language,
    fingerprint: &Fingerprint,
    context_url: &str,
) -> Job {
    let mut env = vec![EnvVar {
        name: "AWS_REGION".to_string(),
        value: Some(config.storage.region.to_owned()),
        ..Default::default()
    }];

    if let Some(endpoint) = &config.storage.endpoint {
        env.push(EnvVar {
            name: "S3_ENDPOINT".to_string(),
            value: Some(endpoint.to_owned()),
            ..Default::default()
        });
    }

    Job {
        metadata: ObjectMeta {
            name: Some(name(fingerprint)),
            namespace: Some(config.operator.build_namespace.to_owned()),
            labels: Some(labels(fingerprint)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            // the build coordinator owns the retry policy, a failed pod is
            // observed and recreated under a fresh attempt
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(fingerprint)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(config.build.service_account.to_owned()),
                    containers: vec![Container {
                        name: "builder".to_string(),
                        image: Some(config.build.image.to_owned()),
                        args: Some(vec![
                            format!("--context={context_url}"),
                            format!(
                                "--destination={}",
                                destination(config, language, fingerprint)
                            ),
                            "--digest-file=/dev/termination-log".to_string(),
                        ]),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn labels(fingerprint: &Fingerprint) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (FINGERPRINT_LABEL.to_string(), fingerprint.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use crate::svc::build::fingerprint;

    use super::*;

    #[test]
    fn job_is_labelled_with_the_fingerprint() {
        let config = Configuration::test();
        let fingerprint = fingerprint::compute(
            b"def handler(event, context): return {}",
            Language::Python,
            "3.12",
            "handler",
        );

        let job = render(&config, Language::Python, &fingerprint, "s3://lambda-sources/contexts/test.tar.gz");

        assert_eq!(
            job.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(FINGERPRINT_LABEL)),
            Some(&fingerprint.to_string())
        );
        assert_eq!(job.metadata.namespace.as_deref(), Some("lambda-builds"));
        assert_eq!(
            job.spec.as_ref().and_then(|spec| spec.backoff_limit),
            Some(0)
        );
    }

    #[test]
    fn destination_is_keyed_by_language_and_fingerprint() {
        let config = Configuration::test();
        let fingerprint =
            fingerprint::compute(b"module.exports = () => ({})", Language::Node, "20", "main");

        assert_eq!(
            destination(&config, Language::Node, &fingerprint),
            format!("registry.lambda.sh/node:{fingerprint}")
        );
    }
}
