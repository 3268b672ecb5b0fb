//! # Logging module
//!
//! This module provides logging facilities and helpers

#[cfg(feature = "trace")]
use std::sync::Arc;

use tracing::Level;

#[cfg(feature = "trace")]
use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[cfg(feature = "trace")]
    #[error("failed to build jaeger tracing pipeline, {0}")]
    Pipeline(opentelemetry::trace::TraceError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(not(feature = "trace"))]
pub fn initialize(verbosity: usize) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level(verbosity))
            .with_thread_names(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}

#[cfg(feature = "trace")]
pub fn initialize(config: &Arc<Configuration>, verbosity: usize) -> Result<(), Error> {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level(verbosity))
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .finish();

    match &config.jaeger {
        Some(jaeger) => {
            let mut pipeline = opentelemetry_jaeger::new_collector_pipeline()
                .with_service_name(env!("CARGO_PKG_NAME"))
                .with_endpoint(&jaeger.endpoint)
                .with_reqwest();

            if let Some(user) = &jaeger.user {
                pipeline = pipeline.with_username(user);
            }

            if let Some(password) = &jaeger.password {
                pipeline = pipeline.with_password(password);
            }

            let tracer = pipeline
                .install_batch(opentelemetry::runtime::Tokio)
                .map_err(Error::Pipeline)?;

            tracing::subscriber::set_global_default(
                subscriber.with(tracing_opentelemetry::layer().with_tracer(tracer)),
            )
            .map_err(Error::GlobalDefaultSubscriber)
        }
        None => tracing::subscriber::set_global_default(subscriber)
            .map_err(Error::GlobalDefaultSubscriber),
    }
}
