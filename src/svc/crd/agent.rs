//! # Lambda agent custom resource
//!
//! This module provides the lambda agent custom resource and its
//! reconciliation loop. Agents ship a pre-built image, the pipeline skips the
//! build entirely and goes straight to the runtime deployment.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use kube::{
    runtime::{controller, watcher, Controller},
    Api, CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    cfg::Configuration,
    crd::{
        function::{converge, StatusExt},
        validate_scaling, ConditionStatus, ConditionType, ErrorKind, Eventing, Kind, Observability,
        Phase, Scaling, Status, ValidationError,
    },
    deploy,
    k8s::{self, finalizer, recorder, resource, Context, ControllerBuilder, Recoverable},
    knative::{eventing::Trigger, messaging::Channel, serving::Service, EnvVar},
    render::{self, Workload},
};

// -----------------------------------------------------------------------------
// Constants

pub const AGENT_FINALIZER: &str = "api.lambda.sh/agent";

// -----------------------------------------------------------------------------
// Image structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Image {
    #[serde(rename = "repository")]
    pub repository: String,
    #[serde(rename = "tag")]
    pub tag: String,
    #[serde(rename = "digest", skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Display for Image {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.repository, digest),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

// -----------------------------------------------------------------------------
// Ai structure

/// opaque model configuration handed to the agent as environment, the
/// operator does not interpret it
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Ai {
    #[serde(rename = "provider")]
    pub provider: String,
    #[serde(rename = "endpoint")]
    pub endpoint: String,
    #[serde(rename = "model")]
    pub model: String,
    #[serde(rename = "temperature", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "systemPrompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(rename = "intents", default)]
    pub intents: Vec<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "api.lambda.sh")]
#[kube(version = "v1alpha1")]
#[kube(kind = "LambdaAgent")]
#[kube(singular = "lambdaagent")]
#[kube(plural = "lambdaagents")]
#[kube(shortname = "agent")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"model", "type":"string", "description":"Model", "jsonPath":".spec.ai.model"}"#
)]
pub struct Spec {
    #[serde(rename = "image")]
    pub image: Image,
    #[serde(rename = "ai")]
    pub ai: Ai,
    #[serde(rename = "eventing", default)]
    pub eventing: Eventing,
    #[serde(rename = "scaling")]
    pub scaling: Scaling,
    #[serde(rename = "observability", default)]
    pub observability: Observability,
}

impl Spec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.repository.is_empty() {
            return Err(ValidationError::EmptyImageRepository);
        }

        validate_scaling(&self.scaling)?;

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// LambdaAgent implementation

impl LambdaAgent {
    pub fn status_mut(&mut self) -> &mut Status {
        self.status.get_or_insert_with(Status::default)
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    /// flatten the custom resource into the kind-agnostic renderer input, the
    /// ai block is handed over as plain environment
    pub fn workload(&self, config: &Configuration) -> Workload {
        let (namespace, name) = resource::namespaced_name(self);
        let ai = &self.spec.ai;

        let mut env = vec![
            EnvVar {
                name: "AI_PROVIDER".to_string(),
                value: ai.provider.to_owned(),
            },
            EnvVar {
                name: "AI_ENDPOINT".to_string(),
                value: ai.endpoint.to_owned(),
            },
            EnvVar {
                name: "AI_MODEL".to_string(),
                value: ai.model.to_owned(),
            },
            EnvVar {
                name: "CE_BROKER_URL".to_string(),
                value: format!(
                    "{}/{}/{}",
                    config.bridge.endpoint, namespace, config.operator.broker_name
                ),
            },
        ];

        if let Some(temperature) = ai.temperature {
            env.push(EnvVar {
                name: "AI_TEMPERATURE".to_string(),
                value: temperature.to_string(),
            });
        }

        if let Some(system_prompt) = &ai.system_prompt {
            env.push(EnvVar {
                name: "AI_SYSTEM_PROMPT".to_string(),
                value: system_prompt.to_owned(),
            });
        }

        if !ai.intents.is_empty() {
            env.push(EnvVar {
                name: "AI_INTENTS".to_string(),
                value: ai.intents.join(","),
            });
        }

        Workload {
            kind: Kind::Agent,
            namespace,
            name,
            image: self.spec.image.to_string(),
            env,
            eventing: self.spec.eventing.to_owned(),
            scaling: self.spec.scaling.to_owned(),
            observability: self.spec.observability.to_owned(),
            timeout_seconds: None,
            resources: None,
            broker: config.operator.broker_name.to_owned(),
            owner: resource::owner_reference(self),
        }
    }
}

impl StatusExt for LambdaAgent {
    fn status_handle(&mut self) -> &mut Status {
        self.status_mut()
    }

    fn phase(&self) -> Phase {
        LambdaAgent::phase(self)
    }
}

// -----------------------------------------------------------------------------
// Action structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    UpsertFinalizer,
    DeploySucceeded,
    DeleteArtifacts,
    DeleteFinalizer,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::UpsertFinalizer => write!(f, "UpsertFinalizer"),
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
    #[error("failed to deploy runtime resources, {0}")]
    Deploy(deploy::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
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

impl From<super::function::ReconcilerError> for ReconcilerError {
    fn from(err: super::function::ReconcilerError) -> Self {
        match err {
            super::function::ReconcilerError::KubeClient(err) => Self::KubeClient(err),
            super::function::ReconcilerError::Diff(err) => Self::Diff(err),
            super::function::ReconcilerError::Deploy(err) => Self::Deploy(err),
            other => Self::Reconcile(other.to_string()),
        }
    }
}

impl Recoverable for ReconcilerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Deploy(_) => ErrorKind::DeployError,
            Self::Reconcile(_) | Self::KubeClient(_) | Self::Diff(_) => ErrorKind::Internal,
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<LambdaAgent> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<LambdaAgent> {
        let client = context.kube.to_owned();

        Controller::new(Api::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Service>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Trigger>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Channel>::all(client), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<LambdaAgent> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(
        ctx: Arc<Context>,
        origin: Arc<LambdaAgent>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context { kube, config, .. } = ctx.as_ref();
        let kind = LambdaAgent::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let generation = origin.meta().generation.unwrap_or(0);

        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let had_finalizer = finalizer::contains(&*origin, AGENT_FINALIZER);
        let modified = finalizer::add((*origin).to_owned(), AGENT_FINALIZER);

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
            let message = &format!("Create finalizer '{}'", AGENT_FINALIZER);
            recorder::normal(kube.to_owned(), &modified, action, message).await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: a new generation leaves a parked failure behind

        if modified.phase() == Phase::Failed
            && modified.status_mut().observed_generation != Some(generation)
        {
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
        // Step 4: render and apply the runtime resources, no build pipeline

        {
            let status = modified.status_mut();
            status.set_condition(ConditionType::Built, ConditionStatus::True, Some("PrebuiltImage"), None);
        }

        let workload = modified.workload(config);
        let children = render::render(&workload);
        let convergence = deploy::apply(ctx.as_ref(), &workload, &children)
            .await
            .map_err(ReconcilerError::Deploy)?;

        converge(ctx.as_ref(), &*origin, modified, &kind, generation, convergence)
            .await
            .map_err(ReconcilerError::from)
    }

    async fn delete(
        ctx: Arc<Context>,
        origin: Arc<LambdaAgent>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context { kube, config, .. } = ctx.as_ref();
        let kind = LambdaAgent::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);

        if !finalizer::contains(&*origin, AGENT_FINALIZER) {
            return Ok(controller::Action::await_change());
        }

        let mut modified = (*origin).to_owned();
        modified.status_mut().phase = Phase::Terminating;

        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch_status(kube.to_owned(), modified, patch).await?;

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Delete managed artifacts of custom resource",
        );

        let workload = modified.workload(config);
        deploy::teardown(ctx.as_ref(), &workload).await?;

        let action = &Action::DeleteArtifacts;
        let message = "Delete runtime service, event bindings and dead-letter channel";
        recorder::normal(kube.to_owned(), &modified, action, message).await?;

        let modified = finalizer::remove(modified, AGENT_FINALIZER);

        let action = &Action::DeleteFinalizer;
        let message = "Delete finalizer from custom resource";
        recorder::normal(kube.to_owned(), &modified, action, message).await?;

        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        resource::patch(kube.to_owned(), &modified, patch).await?;

        Ok(controller::Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Spec {
        Spec {
            image: Image {
                repository: "ghcr.io/acme/support-agent".to_string(),
                tag: "v1".to_string(),
                digest: None,
            },
            ai: Ai {
                provider: "anthropic".to_string(),
                endpoint: "https://api.example.com".to_string(),
                model: "m".to_string(),
                temperature: Some(0.2),
                system_prompt: None,
                intents: vec!["chat".to_string()],
            },
            eventing: Eventing::default(),
            scaling: Scaling {
                min_replicas: 1,
                max_replicas: 3,
                concurrency_target: 4,
            },
            observability: Observability::default(),
        }
    }

    #[test]
    fn a_complete_spec_is_valid() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn an_empty_repository_is_rejected() {
        let mut spec = spec();
        spec.image.repository = String::new();

        assert_eq!(
            spec.validate(),
            Err(ValidationError::EmptyImageRepository)
        );
    }

    #[test]
    fn image_reference_prefers_the_digest() {
        let mut image = spec().image;
        assert_eq!(image.to_string(), "ghcr.io/acme/support-agent:v1");

        image.digest = Some("sha256:abc".to_string());
        assert_eq!(image.to_string(), "ghcr.io/acme/support-agent@sha256:abc");
    }

    #[test]
    fn ai_block_is_flattened_into_the_environment() {
        let agent = LambdaAgent::new("support", spec());
        let config = crate::svc::cfg::Configuration::test();

        // the agent has no namespace in this fixture, fake one through meta
        let mut agent = agent;
        agent.metadata.namespace = Some("default".to_string());
        agent.metadata.uid = Some("00000000-0000-0000-0000-000000000000".to_string());

        let workload = agent.workload(&config);
        let names = workload
            .env
            .iter()
            .map(|var| var.name.as_str())
            .collect::<Vec<_>>();

        assert!(names.contains(&"AI_PROVIDER"));
        assert!(names.contains(&"AI_MODEL"));
        assert!(names.contains(&"AI_TEMPERATURE"));
        assert!(names.contains(&"AI_INTENTS"));
        assert!(!names.contains(&"AI_SYSTEM_PROMPT"));

        assert!(workload
            .env
            .iter()
            .any(|var| var.name == "AI_INTENTS" && var.value == "chat"));
    }
}
