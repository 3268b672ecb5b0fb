//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{
    convert::Infallible,
    io,
    path::PathBuf,
    process::abort,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    build::cache::Cache,
    cfg::Configuration,
    crd::{agent, function},
    http::server,
    k8s::{client, lease, Context, Watcher},
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to interact with custom resource definition, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to retrieve hostname for leader election identity, {0}")]
    Hostname(io::Error),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[command(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(cmd) => cmd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| {
                    Error::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl paw::ParseArgs for Args {
    type Error = Infallible;

    fn parse_args() -> Result<Self, Self::Error> {
        Ok(<Self as Parser>::parse())
    }
}

// -----------------------------------------------------------------------------
// daemon function

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Create the image digest cache and rehydrate it from the build namespace
    let cache = Cache::default();

    // -------------------------------------------------------------------------
    // Create the object storage client from the configuration
    let storage = crate::svc::build::source::client(&config).await;

    // -------------------------------------------------------------------------
    // Create the shared reconciler context
    let context = Arc::new(Context::new(
        kube_client.to_owned(),
        storage,
        cache,
        config.to_owned(),
    ));

    // -------------------------------------------------------------------------
    // Acquire leadership before starting reconcilers, standbys stay idle here
    let identity = hostname::get()
        .map_err(Error::Hostname)?
        .to_string_lossy()
        .to_string();

    let elector = lease::Elector::new(
        kube_client.to_owned(),
        &config.operator.lease_name,
        &identity,
        config.operator.lease_duration_seconds,
    );

    let ready = Arc::new(AtomicBool::new(false));

    // -------------------------------------------------------------------------
    // Create http server, it serves the liveness probe while we still wait for
    // the leadership lease
    let server = tokio::spawn(server::serve(config.to_owned(), ready.to_owned()));

    info!(
        lease = &config.operator.lease_name,
        identity = &identity,
        "Wait for leadership lease before starting reconcilers",
    );

    if let Err(err) = elector.acquire().await {
        error!(
            error = err.to_string(),
            "Could not acquire leadership lease"
        );

        abort();
    }

    ready.store(true, Ordering::SeqCst);
    info!(identity = &identity, "Acquired leadership lease");

    if let Err(err) = context.cache.rehydrate(&kube_client, &config).await {
        error!(
            error = err.to_string(),
            "Could not rehydrate image digest cache from the build namespace"
        );
    }

    // -------------------------------------------------------------------------
    // Create reconcilers
    let function_context = context.to_owned();
    let agent_context = context.to_owned();

    let handles = vec![
        tokio::spawn(async move {
            let reconciler = function::Reconciler::default();

            info!("Start to listen for events of lambda function custom resource");
            if let Err(err) = reconciler.watch(function_context).await {
                error!(
                    error = err.to_string(),
                    "Could not reconcile lambda function custom resource"
                );
            }

            abort();
        }),
        tokio::spawn(async move {
            let reconciler = agent::Reconciler::default();

            info!("Start to listen for events of lambda agent custom resource");
            if let Err(err) = reconciler.watch(agent_context).await {
                error!(
                    error = err.to_string(),
                    "Could not reconcile lambda agent custom resource"
                );
            }

            abort();
        }),
        tokio::spawn({
            let elector = elector.to_owned();

            async move {
                if let Err(err) = elector.renew().await {
                    error!(
                        error = err.to_string(),
                        "Lost leadership lease, halting to let a standby take over"
                    );
                }

                abort();
            }
        }),
    ];

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;
    ready.store(false, Ordering::SeqCst);

    // -------------------------------------------------------------------------
    // Cancel reconcilers and the lease renewal
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(
                    error = err.to_string(),
                    "Could not wait for the task to complete"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Release the leadership lease so a standby takes over immediately
    if let Err(err) = elector.release().await {
        error!(
            error = err.to_string(),
            "Could not release the leadership lease"
        );
    }

    // -------------------------------------------------------------------------
    // Cancel http server
    server.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            error!(
                error = err.to_string(),
                "Could not wait for the http server to gracefully close"
            );
        }
    }

    Ok(())
}
