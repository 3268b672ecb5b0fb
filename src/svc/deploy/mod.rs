//! # Deploy module
//!
//! This module provide the deployer, applying the rendered child set of a
//! workload and reporting how far the cluster has converged towards it. All
//! writes go through server-side apply, a converged reconcile performs no
//! mutation at all.

use kube::{api::ListParams, Api, ResourceExt};
use tracing::{debug, info};

use crate::svc::{
    k8s::{resource, Context},
    knative::{
        eventing::{Broker, Trigger},
        messaging::Channel,
        ready_reason,
        serving::Service,
    },
    render::{self, ChildSet, Workload, KIND_LABEL, NAME_LABEL},
};

// -----------------------------------------------------------------------------
// constants

pub const REASON_BROKER_UNAVAILABLE: &str = "BrokerUnavailable";
pub const REASON_BINDINGS_PENDING: &str = "BindingsPending";
pub const REASON_INSUFFICIENT_CAPACITY: &str = "InsufficientCapacity";
pub const REASON_REVISION_PENDING: &str = "RevisionPending";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// Convergence structure

/// observed distance between the rendered child set and the cluster
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Convergence {
    pub service_ready: bool,
    pub service_reason: Option<String>,
    pub events_bound: bool,
    pub events_reason: Option<String>,
    pub healthy: bool,
    pub healthy_reason: Option<String>,
    pub url: Option<String>,
    pub replicas: Option<i32>,
}

impl Convergence {
    /// the workload is fully converged when its revision serves and all its
    /// event bindings are active
    pub fn converged(&self) -> bool {
        self.service_ready && self.events_bound
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// apply the child set of the workload and observe its convergence
pub async fn apply(
    ctx: &Context,
    workload: &Workload,
    children: &ChildSet,
) -> Result<Convergence, Error> {
    let kube = &ctx.kube;

    // -------------------------------------------------------------------------
    // Step 1: apply the identity, runtime service and event plumbing

    resource::apply(kube.to_owned(), &children.service_account).await?;
    resource::apply(kube.to_owned(), &children.service).await?;

    if let Some(dlq) = &children.dlq {
        resource::apply(kube.to_owned(), dlq).await?;
    }

    for trigger in &children.triggers {
        resource::apply(kube.to_owned(), trigger).await?;
    }

    // -------------------------------------------------------------------------
    // Step 2: drop the event bindings that are no longer declared

    sweep(ctx, workload, children).await?;

    // -------------------------------------------------------------------------
    // Step 3: observe convergence

    observe(ctx, workload, children).await
}

/// delete triggers and the dead-letter channel left behind by a previous
/// generation of the spec
async fn sweep(ctx: &Context, workload: &Workload, children: &ChildSet) -> Result<(), Error> {
    let triggers: Api<Trigger> = Api::namespaced(ctx.kube.to_owned(), &workload.namespace);

    let selector = format!(
        "{KIND_LABEL}={},{NAME_LABEL}={}",
        workload.kind, workload.name
    );

    let desired = children
        .triggers
        .iter()
        .filter_map(|trigger| trigger.metadata.name.to_owned())
        .collect::<Vec<_>>();

    for trigger in triggers.list(&ListParams::default().labels(&selector)).await? {
        let name = trigger.name_any();

        if !desired.contains(&name) {
            info!(
                namespace = &workload.namespace,
                name = &name,
                "Delete event binding no longer declared by the custom resource",
            );

            resource::delete::<Trigger>(ctx.kube.to_owned(), &workload.namespace, &name).await?;
        }
    }

    if children.dlq.is_none() {
        resource::delete::<Channel>(
            ctx.kube.to_owned(),
            &workload.namespace,
            &render::eventing::dlq_name(workload),
        )
        .await?;
    }

    Ok(())
}

/// read the live state of the child set back and summarize it
async fn observe(
    ctx: &Context,
    workload: &Workload,
    children: &ChildSet,
) -> Result<Convergence, Error> {
    let mut convergence = Convergence::default();

    // -------------------------------------------------------------------------
    // runtime service readiness gates the rollout, the previous revision keeps
    // serving until the new one reports ready

    let service: Option<Service> =
        resource::get(ctx.kube.to_owned(), &workload.namespace, &workload.name).await?;

    if let Some(service) = &service {
        convergence.service_ready = service.ready();
        convergence.url = service
            .status
            .as_ref()
            .and_then(|status| status.url.to_owned());
        convergence.replicas = service
            .status
            .as_ref()
            .and_then(|status| status.actual_replicas);

        if !convergence.service_ready {
            convergence.service_reason = service
                .status
                .as_ref()
                .and_then(|status| ready_reason(&status.conditions))
                .or_else(|| Some(REASON_REVISION_PENDING.to_string()));
        }
    } else {
        convergence.service_reason = Some(REASON_REVISION_PENDING.to_string());
    }

    // -------------------------------------------------------------------------
    // the broker must accept events before any binding can become active

    let broker: Option<Broker> = resource::get(
        ctx.kube.to_owned(),
        &workload.namespace,
        &ctx.config.operator.broker_name,
    )
    .await?;

    let broker_ready = broker.as_ref().map(Broker::ready).unwrap_or(false);

    if !broker_ready {
        convergence.events_bound = false;
        convergence.events_reason = Some(REASON_BROKER_UNAVAILABLE.to_string());
    } else if children.triggers.is_empty() {
        // nothing to bind, the workload only answers direct requests
        convergence.events_bound = true;
    } else {
        let mut bound = 0;

        for desired in &children.triggers {
            let live: Option<Trigger> = resource::get(
                ctx.kube.to_owned(),
                &workload.namespace,
                &desired.name_any(),
            )
            .await?;

            if live.map(|trigger| trigger.ready()).unwrap_or(false) {
                bound += 1;
            }
        }

        convergence.events_bound = bound == children.triggers.len();
        if !convergence.events_bound {
            convergence.events_reason = Some(REASON_BINDINGS_PENDING.to_string());
        }
    }

    // -------------------------------------------------------------------------
    // warm minimum replicas, the platform must sustain the request

    let min = workload.scaling.min_replicas;
    convergence.healthy = convergence.service_ready;
    if convergence.service_ready && min > 0 {
        if let Some(replicas) = convergence.replicas {
            if replicas < min {
                convergence.healthy = false;
                convergence.healthy_reason = Some(REASON_INSUFFICIENT_CAPACITY.to_string());
            }
        }
    }

    debug!(
        namespace = &workload.namespace,
        name = &workload.name,
        service_ready = convergence.service_ready,
        events_bound = convergence.events_bound,
        healthy = convergence.healthy,
        "Observed convergence of the child set",
    );

    Ok(convergence)
}

/// delete every child resource exclusively owned by the workload, invoked on
/// finalization. Shared build artifacts are left in place
pub async fn teardown(ctx: &Context, workload: &Workload) -> Result<(), Error> {
    let kube = &ctx.kube;
    let namespace = &workload.namespace;

    resource::delete::<Service>(kube.to_owned(), namespace, &workload.name).await?;
    resource::delete::<k8s_openapi::api::core::v1::ServiceAccount>(
        kube.to_owned(),
        namespace,
        &render::rbac::name(workload),
    )
    .await?;

    let triggers: Api<Trigger> = Api::namespaced(kube.to_owned(), namespace);
    let selector = format!(
        "{KIND_LABEL}={},{NAME_LABEL}={}",
        workload.kind, workload.name
    );

    for trigger in triggers.list(&ListParams::default().labels(&selector)).await? {
        resource::delete::<Trigger>(kube.to_owned(), namespace, &trigger.name_any()).await?;
    }

    resource::delete::<Channel>(kube.to_owned(), namespace, &render::eventing::dlq_name(workload))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_requires_service_and_bindings() {
        let convergence = Convergence {
            service_ready: true,
            events_bound: false,
            ..Default::default()
        };

        assert!(!convergence.converged());

        let convergence = Convergence {
            service_ready: true,
            events_bound: true,
            ..Default::default()
        };

        assert!(convergence.converged());
    }
}
