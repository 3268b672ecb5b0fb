//! # Lambda function custom resource
//!
//! This module provides the lambda function custom resource and its
//! reconciliation loop, source to built image to serverless runtime service

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{
    runtime::{controller, watcher, Controller},
    Api, CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::svc::{
    build::{self, fingerprint, source, wrapper},
    cfg::Configuration,
    crd::{
        validate_scaling, validate_timeout, ConditionStatus, ConditionType, ErrorKind, Eventing,
        Kind, Language, Observability, Phase, Scaling, Status, ValidationError,
    },
    deploy,
    k8s::{self, finalizer, recorder, resource, Context, ControllerBuilder, Recoverable},
    knative::{eventing::Trigger, messaging::Channel, serving::Service, EnvVar, ResourceRequirements},
    render::{self, Workload},
};

// -----------------------------------------------------------------------------
// Constants

pub const FUNCTION_FINALIZER: &str = "api.lambda.sh/function";

/// resync interval of a converged resource, drift is healed at this cadence
pub const RESYNC_SECONDS: u64 = 300;

// -----------------------------------------------------------------------------
// Source structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum SourceType {
    #[serde(rename = "inline")]
    Inline,
    #[serde(rename = "objectRef")]
    ObjectRef,
}

impl Display for SourceType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::ObjectRef => write!(f, "objectRef"),
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ObjectRef {
    #[serde(rename = "bucket")]
    pub bucket: String,
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "checksum", skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct InlineSource {
    #[serde(rename = "blob")]
    pub blob: String,
    #[serde(rename = "language")]
    pub language: Language,
    #[serde(rename = "entrypoint")]
    pub entrypoint: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Source {
    #[serde(rename = "type")]
    pub r#type: SourceType,
    #[serde(rename = "objectRef", skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectRef>,
    #[serde(rename = "inline", skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineSource>,
}

// -----------------------------------------------------------------------------
// Runtime structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Runtime {
    #[serde(rename = "language")]
    pub language: Language,
    #[serde(rename = "version")]
    pub version: String,
    #[serde(rename = "entrypoint")]
    pub entrypoint: String,
    #[serde(rename = "memory")]
    pub memory: String,
    #[serde(rename = "cpu")]
    pub cpu: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: i64,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "api.lambda.sh")]
#[kube(version = "v1alpha1")]
#[kube(kind = "LambdaFunction")]
#[kube(singular = "lambdafunction")]
#[kube(plural = "lambdafunctions")]
#[kube(shortname = "fn")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"digest", "type":"string", "description":"Image digest", "jsonPath":".status.imageDigest"}"#
)]
pub struct Spec {
    #[serde(rename = "source")]
    pub source: Source,
    #[serde(rename = "runtime")]
    pub runtime: Runtime,
    #[serde(rename = "eventing", default)]
    pub eventing: Eventing,
    #[serde(rename = "scaling")]
    pub scaling: Scaling,
    #[serde(rename = "observability", default)]
    pub observability: Observability,
}

impl Spec {
    /// reject the spec before any side effect, a rejected resource surfaces
    /// `phase=Failed` with a validation error and is not retried. The
    /// unknown-language case is already unrepresentable at the schema level.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.inline.is_some() && self.source.object_ref.is_some() {
            return Err(ValidationError::ConflictingSource);
        }

        if self.source.inline.is_none() && self.source.object_ref.is_none() {
            return Err(ValidationError::MissingSource);
        }

        match self.source.r#type {
            SourceType::Inline if self.source.inline.is_none() => {
                return Err(ValidationError::SourceTypeMismatch(
                    "objectRef".to_string(),
                    "inline".to_string(),
                ));
            }
            SourceType::ObjectRef if self.source.object_ref.is_none() => {
                return Err(ValidationError::SourceTypeMismatch(
                    "inline".to_string(),
                    "objectRef".to_string(),
                ));
            }
            _ => {}
        }

        validate_scaling(&self.scaling)?;
        validate_timeout(self.runtime.timeout_seconds)?;

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// LambdaFunction implementation

impl LambdaFunction {
    pub fn status_mut(&mut self) -> &mut Status {
        self.status.get_or_insert_with(Status::default)
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    /// path of the main source file inside the build context
    pub fn main_path(&self) -> String {
        match &self.spec.source.object_ref {
            Some(object_ref) => object_ref
                .key
                .rsplit('/')
                .next()
                .unwrap_or("source")
                .to_string(),
            None => wrapper::main_file(self.spec.runtime.language).to_string(),
        }
    }

    /// image reference pinned by the given digest
    pub fn image(&self, config: &Configuration, digest: &str) -> String {
        format!(
            "{}/{}@{}",
            config.build.registry, self.spec.runtime.language, digest
        )
    }

    /// flatten the custom resource into the kind-agnostic renderer input
    pub fn workload(&self, config: &Configuration, image: String) -> Workload {
        let (namespace, name) = resource::namespaced_name(self);
        let runtime = &self.spec.runtime;

        let env = vec![
            EnvVar {
                name: "LAMBDA_HANDLER".to_string(),
                value: runtime.entrypoint.to_owned(),
            },
            EnvVar {
                name: "LAMBDA_TIMEOUT_SECONDS".to_string(),
                value: runtime.timeout_seconds.to_string(),
            },
            EnvVar {
                name: "CE_BROKER_URL".to_string(),
                value: format!(
                    "{}/{}/{}",
                    config.bridge.endpoint, namespace, config.operator.broker_name
                ),
            },
        ];

        let requests = BTreeMap::from([
            ("memory".to_string(), runtime.memory.to_owned()),
            ("cpu".to_string(), runtime.cpu.to_owned()),
        ]);

        Workload {
            kind: Kind::Function,
            namespace,
            name,
            image,
            env,
            eventing: self.spec.eventing.to_owned(),
            scaling: self.spec.scaling.to_owned(),
            observability: self.spec.observability.to_owned(),
            timeout_seconds: Some(runtime.timeout_seconds),
            resources: Some(ResourceRequirements {
                requests: requests.to_owned(),
                limits: requests,
            }),
            broker: config.operator.broker_name.to_owned(),
            owner: resource::owner_reference(self),
        }
    }
}

// -----------------------------------------------------------------------------
// Action structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    UpsertFinalizer,
    BuildSucceeded,
    DeploySucceeded,
    DeleteArtifacts,
    DeleteFinalizer,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::UpsertFinalizer => write!(f, "UpsertFinalizer"),
            Self::BuildSucceeded => write!(f, "BuildSucceeded"),
            Self::DeploySucceeded => write!(f, "DeploySucceeded"),
            Self::DeleteArtifacts => write!(f, "DeleteArtifacts"),
            Self::DeleteFinalizer => write!(f, "DeleteFinalizer"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to fetch function source, {0}")]
    Source(source::Error),
    #[error("failed to coordinate image build, {0}")]
    Build(build::Error),
    #[error("failed to deploy runtime resources, {0}")]
    Deploy(deploy::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<source::Error> for ReconcilerError {
    fn from(err: source::Error) -> Self {
        Self::Source(err)
    }
}

impl From<build::Error> for ReconcilerError {
    fn from(err: build::Error) -> Self {
        Self::Build(err)
    }
}

impl From<deploy::Error> for ReconcilerError {
    fn from(err: deploy::Error) -> Self {
        Self::Deploy(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

impl Recoverable for ReconcilerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(_) => ErrorKind::SourceFetchError,
            Self::Build(_) => ErrorKind::BuildError,
            Self::Deploy(_) => ErrorKind::DeployError,
            Self::Reconcile(_) | Self::KubeClient(_) | Self::Diff(_) => ErrorKind::Internal,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<LambdaFunction> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<LambdaFunction> {
        let client = context.kube.to_owned();

        Controller::new(Api::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Service>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Trigger>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Channel>::all(client), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<LambdaFunction> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(
        ctx: Arc<Context>,
        origin: Arc<LambdaFunction>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context { kube, config, .. } = ctx.as_ref();
        let kind = LambdaFunction::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let generation = origin.meta().generation.unwrap_or(0);

        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let had_finalizer = finalizer::contains(&*origin, FUNCTION_FINALIZER);
        let modified = finalizer::add((*origin).to_owned(), FUNCTION_FINALIZER);

        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        let mut modified = resource::patch(kube.to_owned(), &modified, patch).await?;

        if !had_finalizer {
            info!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                "Set finalizer on custom resource",
            );

            let action = &Action::UpsertFinalizer;
            let message = &format!("Create finalizer '{}'", FUNCTION_FINALIZER);
            recorder::normal(kube.to_owned(), &modified, action, message).await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: a new generation leaves a parked failure behind

        if modified.phase() == Phase::Failed
            && modified.status_mut().observed_generation != Some(generation)
        {
            info!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                generation = generation,
                "Generation changed on a failed custom resource, re-enter the pipeline",
            );

            let status = modified.status_mut();
            status.phase = Phase::Pending;
            status.last_error = None;
        }

        // ---------------------------------------------------------------------
        // Step 3: validation

        if let Err(err) = modified.spec.validate() {
            let status = modified.status_mut();
            status.phase = Phase::Failed;
            status.set_error(ErrorKind::ValidationError, &err.to_string());

            let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
            resource::patch_status(kube.to_owned(), modified.to_owned(), patch).await?;

            recorder::warning(kube.to_owned(), &modified, &"ValidationRejected", &err.to_string())
                .await?;

            return Ok(controller::Action::await_change());
        }

        // ---------------------------------------------------------------------
        // Step 4: fetch the source and compute its fingerprint

        let key = format!("{}/{}/{}", &kind, &namespace, &name);
        let (bytes, source_ref) = match source::fetch(&ctx.storage, config, &modified.spec.source)
            .await
        {
            Ok(fetched) => fetched,
            Err(err @ (source::Error::InlineTooLarge { .. } | source::Error::ChecksumMismatch { .. })) => {
                // no retry can make these succeed
                let status = modified.status_mut();
                status.phase = Phase::Failed;
                status.set_error(ErrorKind::SourceFetchError, &err.to_string());

                let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
                resource::patch_status(kube.to_owned(), modified.to_owned(), patch).await?;

                recorder::warning(kube.to_owned(), &modified, &"SourceRejected", &err.to_string())
                    .await?;

                return Ok(controller::Action::await_change());
            }
            Err(err) => {
                if ctx.backoff.attempts(&key) + 1 >= config.storage.max_attempts {
                    let status = modified.status_mut();
                    status.phase = Phase::Failed;
                    status.set_error(ErrorKind::SourceFetchError, &err.to_string());

                    let patch =
                        resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
                    resource::patch_status(kube.to_owned(), modified.to_owned(), patch).await?;

                    recorder::warning(
                        kube.to_owned(),
                        &modified,
                        &"SourceUnreachable",
                        &err.to_string(),
                    )
                    .await?;

                    return Ok(controller::Action::await_change());
                }

                return Err(ReconcilerError::Source(err));
            }
        };

        let runtime = &modified.spec.runtime;
        let fingerprint = fingerprint::compute(
            &bytes,
            runtime.language,
            &runtime.version,
            &runtime.entrypoint,
        );

        // ---------------------------------------------------------------------
        // Step 5: ensure the image exists for this fingerprint

        let outcome = build::ensure_image(
            ctx.as_ref(),
            &fingerprint,
            runtime.language,
            &runtime.entrypoint,
            &modified.main_path(),
            &bytes,
            &source_ref,
        )
        .await?;

        let digest = match outcome {
            build::Outcome::InProgress => {
                debug!(
                    kind = &kind,
                    namespace = &namespace,
                    name = &name,
                    fingerprint = fingerprint.as_str(),
                    "Image build is in progress, requeue",
                );

                let status = modified.status_mut();
                status.phase = Phase::Building;
                status.set_condition(
                    ConditionType::Built,
                    ConditionStatus::False,
                    Some("BuildRunning"),
                    None,
                );

                let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
                resource::patch_status(kube.to_owned(), modified, patch).await?;

                return Ok(controller::Action::requeue(Duration::from_secs(
                    config.operator.requeue_seconds,
                )));
            }
            build::Outcome::Failed(reason) => {
                let status = modified.status_mut();
                status.phase = Phase::Failed;
                status.set_error(ErrorKind::BuildError, &reason);
                status.set_condition(
                    ConditionType::Built,
                    ConditionStatus::False,
                    Some("BuildFailed"),
                    Some(&reason),
                );

                let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
                resource::patch_status(kube.to_owned(), modified.to_owned(), patch).await?;

                recorder::warning(kube.to_owned(), &modified, &"BuildFailed", &reason).await?;

                return Ok(controller::Action::await_change());
            }
            build::Outcome::Ready(digest) => digest,
        };

        let freshly_built = modified
            .status
            .as_ref()
            .and_then(|status| status.image_digest.as_ref())
            != Some(&digest);

        {
            let status = modified.status_mut();
            status.image_digest = Some(digest.to_owned());
            status.set_condition(ConditionType::Built, ConditionStatus::True, None, None);
        }

        if freshly_built {
            let action = &Action::BuildSucceeded;
            let message = &format!("Built image '{digest}' for the function source");
            recorder::normal(kube.to_owned(), &modified, action, message).await?;
        }

        // ---------------------------------------------------------------------
        // Step 6: render and apply the runtime resources

        let image = modified.image(config, &digest);
        let workload = modified.workload(config, image);
        let children = render::render(&workload);
        let convergence = deploy::apply(ctx.as_ref(), &workload, &children).await?;

        converge(
            ctx.as_ref(),
            &*origin,
            modified,
            &kind,
            generation,
            convergence,
        )
        .await
    }

    async fn delete(
        ctx: Arc<Context>,
        origin: Arc<LambdaFunction>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context { kube, config, .. } = ctx.as_ref();
        let kind = LambdaFunction::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);

        if !finalizer::contains(&*origin, FUNCTION_FINALIZER) {
            return Ok(controller::Action::await_change());
        }

        let mut modified = (*origin).to_owned();
        modified.status_mut().phase = Phase::Terminating;

        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch_status(kube.to_owned(), modified, patch).await?;

        // ---------------------------------------------------------------------
        // Step 1: delete exclusively owned artifacts, shared build artifacts
        // stay for the other resources referencing them

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Delete managed artifacts of custom resource",
        );

        let workload = modified.workload(config, String::new());
        deploy::teardown(ctx.as_ref(), &workload).await?;

        let action = &Action::DeleteArtifacts;
        let message = "Delete runtime service, event bindings and dead-letter channel";
        recorder::normal(kube.to_owned(), &modified, action, message).await?;

        // ---------------------------------------------------------------------
        // Step 2: remove the finalizer

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Remove finalizer on custom resource",
        );

        let modified = finalizer::remove(modified, FUNCTION_FINALIZER);

        let action = &Action::DeleteFinalizer;
        let message = "Delete finalizer from custom resource";
        recorder::normal(kube.to_owned(), &modified, action, message).await?;

        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        resource::patch(kube.to_owned(), &modified, patch).await?;

        Ok(controller::Action::await_change())
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// fold the observed convergence into the status and decide the follow-up
/// action, shared verbatim by the agent reconciler
pub(crate) async fn converge<T>(
    ctx: &Context,
    origin: &T,
    mut modified: T,
    kind: &str,
    generation: i64,
    convergence: deploy::Convergence,
) -> Result<controller::Action, ReconcilerError>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + kube::CustomResourceExt
        + StatusExt
        + Serialize
        + serde::de::DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let kube = &ctx.kube;
    let config = &ctx.config;
    let (namespace, name) = resource::namespaced_name(&modified);
    let was_ready = modified.phase() == Phase::Ready;

    let status = modified.status_handle();

    status.set_condition(
        ConditionType::Deployed,
        ConditionStatus::from(convergence.service_ready),
        convergence.service_reason.as_deref(),
        None,
    );
    status.set_condition(
        ConditionType::EventsBound,
        ConditionStatus::from(convergence.events_bound),
        convergence.events_reason.as_deref(),
        None,
    );
    status.set_condition(
        ConditionType::Healthy,
        ConditionStatus::from(convergence.healthy),
        convergence.healthy_reason.as_deref(),
        None,
    );
    status.replica_count = convergence.replicas;

    if convergence.converged() {
        status.phase = Phase::Ready;
        status.observed_generation = Some(generation);
        status.last_error = None;

        let patch = resource::diff(origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch_status(kube.to_owned(), modified, patch).await?;

        if !was_ready {
            info!(
                kind = kind,
                namespace = &namespace,
                name = &name,
                generation = generation,
                url = convergence.url.as_deref().unwrap_or("<none>"),
                "Custom resource is ready, its workload serves traffic",
            );

            let action = &Action::DeploySucceeded;
            let message = &format!(
                "Deployed runtime service '{}'",
                convergence.url.as_deref().unwrap_or(&name)
            );
            recorder::normal(kube.to_owned(), &modified, action, message).await?;
        }

        return Ok(controller::Action::requeue(Duration::from_secs(
            RESYNC_SECONDS,
        )));
    }

    // ---------------------------------------------------------------------
    // still deploying, give up past the converge timeout

    let deploying_since = status
        .condition(ConditionType::Deployed)
        .filter(|condition| condition.status == ConditionStatus::False)
        .and_then(|condition| {
            DateTime::parse_from_rfc3339(&condition.last_transition_time).ok()
        });

    let timed_out = deploying_since
        .map(|since| {
            Utc::now().signed_duration_since(since)
                > chrono::Duration::seconds(config.operator.converge_timeout_seconds as i64)
        })
        .unwrap_or(false);

    if timed_out {
        status.phase = Phase::Failed;
        let message = convergence
            .service_reason
            .or(convergence.events_reason)
            .unwrap_or_else(|| "convergence timed out".to_string());
        status.set_error(ErrorKind::DeployError, &message);

        let patch = resource::diff(origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch_status(kube.to_owned(), modified, patch).await?;

        recorder::warning(kube.to_owned(), &modified, &"DeployTimeout", &message).await?;

        return Ok(controller::Action::await_change());
    }

    status.phase = Phase::Deploying;

    let patch = resource::diff(origin, &modified).map_err(ReconcilerError::Diff)?;
    resource::patch_status(kube.to_owned(), modified, patch).await?;

    Ok(controller::Action::requeue(Duration::from_secs(
        config.operator.requeue_seconds,
    )))
}

// -----------------------------------------------------------------------------
// StatusExt trait

/// uniform access to the shared status record from both custom resources
pub trait StatusExt {
    fn status_handle(&mut self) -> &mut Status;
    fn phase(&self) -> Phase;
}

impl StatusExt for LambdaFunction {
    fn status_handle(&mut self) -> &mut Status {
        self.status_mut()
    }

    fn phase(&self) -> Phase {
        LambdaFunction::phase(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(source: Source) -> Spec {
        Spec {
            source,
            runtime: Runtime {
                language: Language::Python,
                version: "3.12".to_string(),
                entrypoint: "handler".to_string(),
                memory: "128Mi".to_string(),
                cpu: "100m".to_string(),
                timeout_seconds: 30,
            },
            eventing: Eventing::default(),
            scaling: Scaling {
                min_replicas: 0,
                max_replicas: 3,
                concurrency_target: 10,
            },
            observability: Observability::default(),
        }
    }

    fn inline() -> Source {
        Source {
            r#type: SourceType::Inline,
            object_ref: None,
            inline: Some(InlineSource {
                blob: "def handler(event, context):\n    return {'ok': True}\n".to_string(),
                language: Language::Python,
                entrypoint: "handler".to_string(),
            }),
        }
    }

    #[test]
    fn a_single_inline_source_is_valid() {
        assert!(spec(inline()).validate().is_ok());
    }

    #[test]
    fn both_source_variants_are_rejected() {
        let mut source = inline();
        source.object_ref = Some(ObjectRef {
            bucket: "lambda-sources".to_string(),
            key: "hello.tar.gz".to_string(),
            checksum: None,
        });

        assert_eq!(
            spec(source).validate(),
            Err(ValidationError::ConflictingSource)
        );
    }

    #[test]
    fn a_missing_source_variant_is_rejected() {
        let source = Source {
            r#type: SourceType::Inline,
            object_ref: None,
            inline: None,
        };

        assert_eq!(spec(source).validate(), Err(ValidationError::MissingSource));
    }

    #[test]
    fn a_mismatched_source_type_is_rejected() {
        let mut source = inline();
        source.r#type = SourceType::ObjectRef;

        assert_eq!(
            spec(source).validate(),
            Err(ValidationError::SourceTypeMismatch(
                "inline".to_string(),
                "objectRef".to_string()
            ))
        );
    }

    #[test]
    fn scaling_and_timeout_bounds_are_enforced() {
        let mut invalid = spec(inline());
        invalid.scaling.max_replicas = -1;
        assert!(invalid.validate().is_err());

        let mut invalid = spec(inline());
        invalid.runtime.timeout_seconds = 901;
        assert_eq!(
            invalid.validate(),
            Err(ValidationError::TimeoutOutOfRange(901))
        );
    }

    #[test]
    fn main_path_follows_the_source_variant() {
        let function = LambdaFunction::new("hello", spec(inline()));
        assert_eq!(function.main_path(), "main.py");

        let mut source = inline();
        source.r#type = SourceType::ObjectRef;
        source.inline = None;
        source.object_ref = Some(ObjectRef {
            bucket: "lambda-sources".to_string(),
            key: "releases/hello/bundle.tar.gz".to_string(),
            checksum: None,
        });

        let function = LambdaFunction::new("hello", spec(source));
        assert_eq!(function.main_path(), "bundle.tar.gz");
    }
}
