//! # Build module
//!
//! This module provide the build coordinator of the function pipeline. It
//! maps fingerprints to previously built digests, creates and supervises the
//! in-cluster image build jobs and guarantees at most one running build per
//! fingerprint, creation races being resolved by observing the already
//! existing fingerprint-labelled job.

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::{api::ListParams, api::PostParams, Api, ResourceExt};
#[cfg(feature = "metrics")]
use prometheus::{
    opts, register_counter_vec, register_histogram, CounterVec, Histogram,
};
use tracing::{debug, info, warn};

use crate::svc::{
    build::fingerprint::Fingerprint,
    crd::Language,
    k8s::{resource, Context},
    knative::serving::Service,
    render::{self, job, FINGERPRINT_LABEL, MANAGED_BY, MANAGED_BY_LABEL},
};

pub mod cache;
pub mod context;
pub mod fingerprint;
pub mod source;
pub mod wrapper;

// -----------------------------------------------------------------------------
// constants

/// exit code the builder uses to signal a non-retryable source problem
pub const BUILDER_EXIT_BAD_SOURCE: i32 = 1;

pub const FAILURE_REASON_BAD_SOURCE: &str = "bad-source";
pub const FAILURE_REASON_INFRA: &str = "infra";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "lambda_operator_build_duration_seconds",
        "duration of image build jobs"
    )
    .expect("metrics 'lambda_operator_build_duration_seconds' to not be already initialized")
});

#[cfg(feature = "metrics")]
static BUILD_FAILURES: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_build_failures_total",
            "number of failed image build jobs"
        ),
        &["reason"]
    )
    .expect("metrics 'lambda_operator_build_failures_total' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to assemble build context, {0}")]
    Context(context::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<context::Error> for Error {
    fn from(err: context::Error) -> Self {
        Self::Context(err)
    }
}

// -----------------------------------------------------------------------------
// Outcome enumeration

/// answer of the coordinator for a fingerprint
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome {
    /// an artifact exists, the digest is final for this fingerprint
    Ready(String),
    /// a build is running or queued, the caller requeues and asks again
    InProgress,
    /// the build failed permanently, the reason is surfaced on the status
    Failed(String),
}

// -----------------------------------------------------------------------------
// Admission structure

/// first-in first-out admission of build jobs under the namespace concurrency
/// cap, no queued fingerprint can be starved by later arrivals
#[derive(Default, Debug)]
pub struct Admission {
    pending: Mutex<VecDeque<String>>,
}

impl Admission {
    /// returns whether the given fingerprint may create its job now, joining
    /// the queue otherwise
    pub fn admit(&self, fingerprint: &str, active: usize, cap: usize) -> bool {
        let mut pending = self
            .pending
            .lock()
            .expect("admission queue mutex to not be poisoned");

        if !pending.iter().any(|f| f == fingerprint) {
            pending.push_back(fingerprint.to_string());
        }

        if active < cap && pending.front().map(|f| f == fingerprint).unwrap_or(false) {
            pending.pop_front();
            return true;
        }

        false
    }

    /// drop the fingerprint from the queue, its build is no longer wanted
    pub fn withdraw(&self, fingerprint: &str) {
        self.pending
            .lock()
            .expect("admission queue mutex to not be poisoned")
            .retain(|f| f != fingerprint);
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// read the image digest a builder wrote to its termination message
pub(crate) fn digest_from_pod(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|status| {
            let terminated = status.state.as_ref()?.terminated.as_ref()?;

            if terminated.exit_code != 0 {
                return None;
            }

            terminated
                .message
                .as_ref()
                .map(|message| message.trim().to_string())
                .filter(|message| !message.is_empty())
        })
}

/// read the exit code of the failed builder container, if any
fn exit_code_from_pod(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|status| {
            let terminated = status.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then_some(terminated.exit_code)
        })
}

/// count the build jobs of the namespace that still hold a concurrency slot
async fn active_builds(jobs: &Api<Job>) -> Result<usize, kube::Error> {
    let list = jobs
        .list(&ListParams::default().labels(FINGERPRINT_LABEL))
        .await?;

    Ok(list
        .items
        .iter()
        .filter(|job| {
            job.status
                .as_ref()
                .map(|status| {
                    status.succeeded.unwrap_or(0) == 0 && status.failed.unwrap_or(0) == 0
                })
                .unwrap_or(true)
        })
        .count())
}

/// ensure an image exists for the given fingerprint, creating or observing
/// the build job as needed. Two reconciles of the same fingerprint coalesce
/// on the labelled job and, through the cache, agree on the final digest
pub async fn ensure_image(
    ctx: &Context,
    fingerprint: &Fingerprint,
    language: Language,
    entrypoint: &str,
    main_path: &str,
    source: &[u8],
    source_ref: &str,
) -> Result<Outcome, Error> {
    let config = &ctx.config;
    let namespace = &config.operator.build_namespace;

    // -------------------------------------------------------------------------
    // Step 1: a cached artifact answers synchronously

    if let Some(digest) = ctx.cache.digest(fingerprint.as_str()).await {
        ctx.admission.withdraw(fingerprint.as_str());
        return Ok(Outcome::Ready(digest));
    }

    let jobs: Api<Job> = Api::namespaced(ctx.kube.to_owned(), namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.kube.to_owned(), namespace);

    // -------------------------------------------------------------------------
    // Step 2: observe the fingerprint-labelled job when it exists

    if let Some(job) = resource::get::<Job>(ctx.kube.to_owned(), namespace, &job::name(fingerprint)).await? {
        let status = job.status.to_owned().unwrap_or_default();

        if status.succeeded.unwrap_or(0) > 0 {
            let selector = format!("{FINGERPRINT_LABEL}={}", fingerprint);
            let digest = pods
                .list(&ListParams::default().labels(&selector))
                .await?
                .items
                .iter()
                .find_map(digest_from_pod);

            let Some(digest) = digest else {
                // the job reports success but its pod is not observable yet
                return Ok(Outcome::InProgress);
            };

            #[cfg(feature = "metrics")]
            if let (Some(started), Some(completed)) = (&status.start_time, &status.completion_time)
            {
                BUILD_DURATION
                    .observe((completed.0 - started.0).num_milliseconds() as f64 / 1_000.0);
            }

            let digest = ctx
                .cache
                .record_success(fingerprint.as_str(), &digest, source_ref)
                .await;

            ctx.admission.withdraw(fingerprint.as_str());

            info!(
                fingerprint = fingerprint.as_str(),
                digest = &digest,
                "Build job succeeded, artifact recorded in the digest cache",
            );

            prune(ctx, &jobs).await?;

            return Ok(Outcome::Ready(digest));
        }

        if status.failed.unwrap_or(0) > 0 {
            let selector = format!("{FINGERPRINT_LABEL}={}", fingerprint);
            let exit_code = pods
                .list(&ListParams::default().labels(&selector))
                .await?
                .items
                .iter()
                .find_map(exit_code_from_pod);

            if exit_code == Some(BUILDER_EXIT_BAD_SOURCE) {
                #[cfg(feature = "metrics")]
                BUILD_FAILURES
                    .with_label_values(&[FAILURE_REASON_BAD_SOURCE])
                    .inc();

                ctx.admission.withdraw(fingerprint.as_str());

                return Ok(Outcome::Failed(format!(
                    "builder rejected the source of fingerprint '{fingerprint}'"
                )));
            }

            #[cfg(feature = "metrics")]
            BUILD_FAILURES
                .with_label_values(&[FAILURE_REASON_INFRA])
                .inc();

            let attempts = ctx
                .cache
                .record_failure(fingerprint.as_str(), source_ref)
                .await;

            if attempts >= config.build.max_attempts {
                ctx.admission.withdraw(fingerprint.as_str());

                return Ok(Outcome::Failed(format!(
                    "build of fingerprint '{fingerprint}' failed {attempts} times"
                )));
            }

            warn!(
                fingerprint = fingerprint.as_str(),
                attempts = attempts,
                "Build job failed on infrastructure, delete it and retry",
            );

            jobs.delete(&job.name_any(), &Default::default()).await?;
            return Ok(Outcome::InProgress);
        }

        // a build is running for this fingerprint, coalesce on it
        debug!(
            fingerprint = fingerprint.as_str(),
            "Build job is running, coalesce",
        );

        return Ok(Outcome::InProgress);
    }

    // -------------------------------------------------------------------------
    // Step 3: admit the creation under the concurrency cap, in arrival order

    let active = active_builds(&jobs).await?;
    if !ctx
        .admission
        .admit(fingerprint.as_str(), active, config.build.concurrency_cap)
    {
        debug!(
            fingerprint = fingerprint.as_str(),
            active = active,
            cap = config.build.concurrency_cap,
            "Build namespace is at its concurrency cap, requeue",
        );

        return Ok(Outcome::InProgress);
    }

    // -------------------------------------------------------------------------
    // Step 4: upload the context and create the job

    let bytes = context::assemble(language, entrypoint, main_path, source)?;
    let url = context::upload(&ctx.storage, config, fingerprint, bytes).await?;

    let job = job::render(config, language, fingerprint, &url);

    info!(
        fingerprint = fingerprint.as_str(),
        context = &url,
        "Create build job for fingerprint",
    );

    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => Ok(Outcome::InProgress),
        // another replica or worker created it first, its job serves us too
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(Outcome::InProgress),
        Err(err) => Err(Error::KubeClient(err)),
    }
}

/// apply the retention policy, keeping the most recent successful artifacts
/// and everything still referenced by a live runtime service
async fn prune(ctx: &Context, jobs: &Api<Job>) -> Result<(), Error> {
    let services: Api<Service> = Api::all(ctx.kube.to_owned());

    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY}");
    let referenced = services
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .iter()
        .flat_map(|service| service.spec.template.spec.containers.iter())
        .filter_map(|container| {
            container
                .image
                .split_once('@')
                .map(|(_, digest)| digest.to_string())
        })
        .collect::<HashSet<_>>();

    let evicted = ctx
        .cache
        .retain(ctx.config.build.retention, &referenced)
        .await;

    for fingerprint in evicted {
        let name = render::job::name(&Fingerprint::from_hex(&fingerprint));

        debug!(
            fingerprint = &fingerprint,
            job = &name,
            "Prune build job beyond the artifact retention",
        );

        if let Err(kube::Error::Api(err)) = jobs.delete(&name, &Default::default()).await {
            if err.code != 404 {
                return Err(Error::KubeClient(kube::Error::Api(err)));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_first_in_first_out() {
        let admission = Admission::default();

        // cap reached, both wait in arrival order
        assert!(!admission.admit("a", 4, 4));
        assert!(!admission.admit("b", 4, 4));

        // a slot frees up, only the head of the queue gets it
        assert!(!admission.admit("b", 3, 4));
        assert!(admission.admit("a", 3, 4));
        assert!(admission.admit("b", 3, 4));
    }

    #[test]
    fn admission_dedupes_requeued_fingerprints() {
        let admission = Admission::default();

        assert!(!admission.admit("a", 4, 4));
        assert!(!admission.admit("a", 4, 4));

        assert!(admission.admit("a", 0, 4));
        // the queue is empty again, a second admit goes straight through
        assert!(admission.admit("a", 0, 4));
    }

    #[test]
    fn withdraw_unblocks_the_next_in_line() {
        let admission = Admission::default();

        assert!(!admission.admit("a", 4, 4));
        assert!(!admission.admit("b", 4, 4));

        admission.withdraw("a");
        assert!(admission.admit("b", 0, 4));
    }

    #[test]
    fn digest_is_read_from_the_termination_message() {
        use k8s_openapi::api::core::v1::{
            ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
        };

        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 0,
                            message: Some("sha256:deadbeef\n".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(digest_from_pod(&pod).as_deref(), Some("sha256:deadbeef"));
    }

    #[test]
    fn failed_pod_yields_no_digest() {
        use k8s_openapi::api::core::v1::{
            ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
        };

        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 1,
                            message: Some("boom".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(digest_from_pod(&pod), None);
        assert_eq!(exit_code_from_pod(&pod), Some(1));
    }
}
