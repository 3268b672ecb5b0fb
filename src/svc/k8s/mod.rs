//! # Kubernetes module
//!
//! This module provide the reconciler trait suite shared by both custom
//! resources, the shared reconciliation context, error classification and the
//! per-object retry backoff

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::{
    collections::HashMap,
    error::Error,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, register_int_gauge_vec, CounterVec, IntGaugeVec};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, sleep_until};
#[cfg(feature = "trace")]
use tracing::Instrument;
use tracing::{debug, error, info, trace, warn};

use crate::svc::{
    build::{cache::Cache, Admission},
    cfg::Configuration,
    crd::ErrorKind,
};

pub mod client;
pub mod finalizer;
pub mod lease;
pub mod recorder;
pub mod resource;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

pub const BACKOFF_BASE_MILLIS: u64 = 1_000;
pub const BACKOFF_FACTOR: u32 = 2;
pub const BACKOFF_CAP_MILLIS: u64 = 300_000;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_reconcile_total",
            "number of reconciliation"
        ),
        &["kind", "result"]
    )
    .expect("metrics 'lambda_operator_reconcile_total' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_reconcile_event",
            "number of upsert and delete reconciliation event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'lambda_operator_reconcile_event' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_reconcile_duration_seconds",
            "duration of reconciliation",
        ),
        &["kind"]
    )
    .expect("metrics 'lambda_operator_reconcile_duration_seconds' to not be already initialized")
});

#[cfg(feature = "metrics")]
static WORKQUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "lambda_operator_workqueue_depth",
        "number of in-flight reconciliation per kind",
        &["kind"]
    )
    .expect("metrics 'lambda_operator_workqueue_depth' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Recoverable trait

/// classify module errors into the status error taxonomy and split terminal
/// failures from transient ones
pub trait Recoverable {
    /// returns the error kind recorded on the custom resource status
    fn kind(&self) -> ErrorKind;

    /// returns whether the error stops retries until the next generation
    /// change
    fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::ValidationError)
    }
}

// -----------------------------------------------------------------------------
// Backoff structure

/// per-object exponential backoff registry, base 1s, factor 2, cap 5min with
/// a ±10% jitter
#[derive(Default, Debug)]
pub struct Backoff {
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    /// record one more failed attempt for the given key and returns the delay
    /// to wait before the next one
    pub fn delay(&self, key: &str) -> Duration {
        let mut attempts = self
            .attempts
            .lock()
            .expect("backoff registry mutex to not be poisoned");

        let attempt = attempts.entry(key.to_string()).or_insert(0);
        *attempt += 1;

        let millis = BACKOFF_BASE_MILLIS
            .saturating_mul(BACKOFF_FACTOR.saturating_pow(*attempt - 1) as u64)
            .min(BACKOFF_CAP_MILLIS);

        let jitter = millis / 10;
        let millis = rand::thread_rng().gen_range(millis - jitter..=millis + jitter);

        Duration::from_millis(millis)
    }

    /// forget the attempts of the given key, to be called once a reconcile
    /// has fully succeeded
    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .expect("backoff registry mutex to not be poisoned")
            .remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .expect("backoff registry mutex to not be poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

// -----------------------------------------------------------------------------
// Context structure

/// contains clients and singletons shared by every reconciliation
pub struct Context {
    pub kube: kube::Client,
    pub storage: aws_sdk_s3::Client,
    pub cache: Cache,
    pub config: Arc<Configuration>,
    pub backoff: Backoff,
    pub admission: Admission,
}

impl Context {
    pub fn new(
        kube: kube::Client,
        storage: aws_sdk_s3::Client,
        cache: Cache,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            kube,
            storage,
            cache,
            config,
            backoff: Backoff::default(),
            admission: Admission::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, context: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the upsert and delete methods given to a kubernetes controller
/// [`Controller<T>`], composed into the reconcile entrypoint with deadline,
/// metrics and backoff handling
#[async_trait]
pub trait Reconciler<T>
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + Debug
        + Clone
        + Send
        + Sync
        + 'static,
{
    type Error: Error + Recoverable + Send + Sync;

    /// create or update the managed artifacts of the object, returns the
    /// follow-up action, either waiting for a change or requeuing to poll a
    /// pending child
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// delete the managed artifacts of the object and release its finalizer
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// returns a [`Action`] to perform following the given error, transient
    /// errors are requeued with the per-object backoff while terminal ones
    /// are parked until the next generation change
    fn retry(obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let key = format!("{}/{}/{}", T::api_resource().kind, namespace, name);

        if err.is_terminal() {
            warn!(
                kind = %err.kind(),
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Park reconciliation of custom resource until its next generation",
            );

            return Action::await_change();
        }

        let delay = ctx.backoff.delay(&key);

        trace!(
            kind = %err.kind(),
            namespace = &namespace,
            name = &name,
            delay = delay.as_millis() as u64,
            "Requeue failed reconciliation",
        );

        Action::requeue(delay)
    }

    /// process the object and perform actions on kubernetes, the object
    /// storage and the event broker, returns a [`Action`] to maybe perform
    /// another reconciliation or an error, if something gets wrong
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();
        let key = format!("{}/{}/{}", &api_resource.kind, &namespace, &name);
        let deadline = Duration::from_secs(ctx.config.operator.deadline_seconds);

        #[cfg(feature = "metrics")]
        WORKQUEUE_DEPTH
            .with_label_values(&[&api_resource.kind])
            .inc();

        let result = if resource::deleted(obj.as_ref()) {
            info!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                "Received deletion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            #[cfg(not(feature = "trace"))]
            let result = tokio::time::timeout(deadline, Self::delete(ctx.to_owned(), obj.to_owned())).await;

            #[cfg(feature = "trace")]
            let result = tokio::time::timeout(deadline, Self::delete(ctx.to_owned(), obj.to_owned()))
                .instrument(tracing::info_span!("Reconciler::delete"))
                .await;

            result
        } else {
            info!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                generation = obj.meta().generation,
                "Received upsertion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_UPSERT_EVENT])
                .inc();

            #[cfg(not(feature = "trace"))]
            let result = tokio::time::timeout(deadline, Self::upsert(ctx.to_owned(), obj.to_owned())).await;

            #[cfg(feature = "trace")]
            let result = tokio::time::timeout(deadline, Self::upsert(ctx.to_owned(), obj.to_owned()))
                .instrument(tracing::info_span!("Reconciler::upsert"))
                .await;

            result
        };

        #[cfg(feature = "metrics")]
        WORKQUEUE_DEPTH
            .with_label_values(&[&api_resource.kind])
            .dec();

        match result {
            Ok(Ok(action)) => {
                ctx.backoff.reset(&key);
                Ok(action)
            }
            Ok(Err(err)) => {
                error!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to reconcile custom resource"
                );

                Err(err)
            }
            Err(_elapsed) => {
                // the deadline aborted in-flight calls, requeue with backoff
                let delay = ctx.backoff.delay(&key);

                warn!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    deadline = deadline.as_secs(),
                    delay = delay.as_millis() as u64,
                    "Reconciliation exceeded its deadline, requeue",
                );

                Ok(Action::requeue(delay))
            }
        }
    }
}

// -----------------------------------------------------------------------------
// WatcherError trait

/// group other trait needed to provide a default
/// implementation for [`Watcher<T>`] trait
pub trait WatcherError:
    From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error
where
    Self: 'static,
{
}

/// Blanket implementation of [`WatcherError<T>`]
impl<T> WatcherError for T
where
    T: From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error,
    Self: 'static,
{
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + DeserializeOwned
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
    <Self as Reconciler<T>>::Error: WatcherError + Recoverable + Send + Sync,
{
    type Error: WatcherError + Send + Sync;

    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, context: Arc<Context>) -> Result<(), <Self as Watcher<T>>::Error> {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(context.to_owned())
            .run(Self::reconcile, Self::retry, context)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return Ok(());
                }
                Ok(Some((obj, _action))) => {
                    info!(
                        kind = &api_resource.kind,
                        namespace = obj.namespace.unwrap_or_else(|| "<none>".to_string()),
                        name = obj.name,
                        "Successfully reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_TOTAL
                        .with_label_values(&[&api_resource.kind, "success"])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj)) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = obj.namespace.unwrap_or_else(|| "<none>".to_string()),
                        name = obj.name,
                        "Received an event about an already deleted resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_TOTAL
                        .with_label_values(&[&api_resource.kind, "success"])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_TOTAL
                        .with_label_values(&[&api_resource.kind, "failure"])
                        .inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind])
                .inc_by(Instant::now().duration_since(instant).as_secs_f64());

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanket implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + DeserializeOwned
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    U::Error: WatcherError + Recoverable + Send + Sync,
    Self: Send + Sync + 'static,
{
    type Error = U::Error;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let backoff = Backoff::default();

        let first = backoff.delay("default/test").as_millis() as u64;
        let second = backoff.delay("default/test").as_millis() as u64;

        // ±10% jitter around 1s then 2s
        assert!((900..=1_100).contains(&first), "got {first}");
        assert!((1_800..=2_200).contains(&second), "got {second}");

        for _ in 0..16 {
            backoff.delay("default/test");
        }

        let capped = backoff.delay("default/test").as_millis() as u64;
        assert!(capped <= BACKOFF_CAP_MILLIS + BACKOFF_CAP_MILLIS / 10, "got {capped}");
    }

    #[test]
    fn backoff_reset_forgets_attempts() {
        let backoff = Backoff::default();

        backoff.delay("default/test");
        backoff.delay("default/test");
        assert_eq!(backoff.attempts("default/test"), 2);

        backoff.reset("default/test");
        assert_eq!(backoff.attempts("default/test"), 0);
    }

    #[test]
    fn backoff_keys_are_independent() {
        let backoff = Backoff::default();

        backoff.delay("default/a");
        backoff.delay("default/a");
        backoff.delay("default/b");

        assert_eq!(backoff.attempts("default/a"), 2);
        assert_eq!(backoff.attempts("default/b"), 1);
    }
}
