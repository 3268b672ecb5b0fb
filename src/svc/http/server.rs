//! # Server module
//!
//! This module provide the HTTP server exposing the health probes, the
//! metrics endpoint and the event bridge ingest

use std::{
    io,
    net::AddrParseError,
    sync::{atomic::AtomicBool, Arc},
};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::svc::{cfg::Configuration, http, http::ServerState};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to bind server, {0}")]
    Bind(io::Error),
    #[error("failed to serve content, {0}")]
    Serve(io::Error),
}

// -----------------------------------------------------------------------------
// serve function

#[tracing::instrument(skip_all)]
pub async fn serve(config: Arc<Configuration>, ready: Arc<AtomicBool>) -> Result<(), Error> {
    let addr: std::net::SocketAddr = config
        .operator
        .listen
        .parse()
        .map_err(|err| Error::Listen(config.operator.listen.to_owned(), err))?;

    let state = ServerState {
        config,
        http: reqwest::Client::new(),
        ready,
    };

    let router = Router::new()
        .route("/healthz", get(http::healthz))
        .route("/readyz", get(http::readyz))
        .route("/events", post(http::events))
        .route("/dlq", post(http::dead_letter));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(http::metrics::handler));

    let router = router
        .fallback(http::not_found)
        .layer(middleware::from_fn(http::layer::access))
        .with_state(state);

    info!("Start to listen for http request on {}", addr);

    let listener = TcpListener::bind(&addr).await.map_err(Error::Bind)?;
    axum::serve(listener, router).await.map_err(Error::Serve)
}
