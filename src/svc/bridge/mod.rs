//! # Bridge module
//!
//! This module provide the event bridge, accepting inbound cloudevents from
//! in-cluster sources and republishing them into the broker with a normalized
//! type and provenance metadata. Malformed events are dropped with a metric
//! and never retried, ordering within a source is whatever the transport
//! delivered.

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::sync::Arc;

use cloudevents::{
    binding::reqwest::RequestBuilderExt, AttributesReader, AttributesWriter, Event,
};
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter, register_counter_vec, Counter, CounterVec};
use tracing::{debug, warn};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// constants

pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

pub const EXTENSION_FORWARDED_BY: &str = "forwardedby";
pub const EXTENSION_ORIGIN_SOURCE: &str = "originsource";
pub const EXTENSION_INTENT: &str = "intent";

pub const RESULT_ACCEPT: &str = "accept";
pub const RESULT_REJECT: &str = "reject";
pub const RESULT_ERROR: &str = "error";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static EVENTS_FORWARDED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_events_forwarded_total",
            "number of events handled by the bridge"
        ),
        &["result"]
    )
    .expect("metrics 'lambda_operator_events_forwarded_total' to not be already initialized")
});

#[cfg(feature = "metrics")]
static EVENT_INTENTS: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "lambda_operator_bridge_intents_total",
            "number of forwarded events carrying an intent label"
        ),
        &["intent"]
    )
    .expect("metrics 'lambda_operator_bridge_intents_total' to not be already initialized")
});

#[cfg(feature = "metrics")]
static DLQ_DELIVERIES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(
        "lambda_operator_dlq_deliveries_total",
        "number of dead-lettered events accounted by the bridge"
    )
    .expect("metrics 'lambda_operator_dlq_deliveries_total' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse structured cloudevent, {0}")]
    Malformed(serde_json::Error),
    #[error("unsupported content type '{0}', the bridge only accepts structured mode")]
    UnsupportedMode(String),
    #[error("event is missing required attribute '{0}'")]
    MissingAttribute(&'static str),
    #[error("failed to serialize event towards the broker, {0}")]
    Message(cloudevents::message::Error),
    #[error("failed to forward event to the broker, {0}")]
    Forward(reqwest::Error),
    #[error("broker refused the event with status {0}")]
    BrokerStatus(u16),
}

impl Error {
    /// rejections are the sender's fault and are never retried, forwarding
    /// problems are the broker's
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::UnsupportedMode(_) | Self::MissingAttribute(_)
        )
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// parse and validate a structured-mode payload, every required cloudevents
/// attribute must be present
pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Event, Error> {
    let content_type = content_type.unwrap_or_default();

    if !content_type.starts_with(STRUCTURED_CONTENT_TYPE) {
        return Err(Error::UnsupportedMode(content_type.to_string()));
    }

    let event: Event = serde_json::from_slice(body).map_err(Error::Malformed)?;

    if event.ty().is_empty() {
        return Err(Error::MissingAttribute("type"));
    }

    if event.source().as_str().is_empty() {
        return Err(Error::MissingAttribute("source"));
    }

    if event.id().is_empty() {
        return Err(Error::MissingAttribute("id"));
    }

    if event.time().is_none() {
        return Err(Error::MissingAttribute("time"));
    }

    if event.datacontenttype().is_none() {
        return Err(Error::MissingAttribute("datacontenttype"));
    }

    if event.data().is_none() {
        return Err(Error::MissingAttribute("data"));
    }

    Ok(event)
}

/// normalize the event type and stamp provenance metadata, the original
/// source survives as an extension
pub fn normalize(mut event: Event, config: &Arc<Configuration>) -> Event {
    let prefix = &config.bridge.type_prefix;
    let origin_source = event.source().to_string();

    let ty = event.ty().to_string();
    if !ty.starts_with(prefix.as_str()) {
        event.set_type(format!("{prefix}{ty}"));
    }

    event.set_extension(EXTENSION_FORWARDED_BY, env!("CARGO_PKG_NAME"));
    event.set_extension(EXTENSION_ORIGIN_SOURCE, origin_source);

    event
}

/// accept, normalize and republish one inbound event into the broker
pub async fn forward(
    http: &reqwest::Client,
    config: &Arc<Configuration>,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<(), Error> {
    let event = match parse(content_type, body) {
        Ok(event) => event,
        Err(err) => {
            #[cfg(feature = "metrics")]
            EVENTS_FORWARDED.with_label_values(&[RESULT_REJECT]).inc();

            warn!(
                error = err.to_string(),
                "Drop malformed event received by the bridge"
            );

            return Err(err);
        }
    };

    let event = normalize(event, config);

    #[cfg(feature = "metrics")]
    if let Some(intent) = event.extension(EXTENSION_INTENT) {
        EVENT_INTENTS
            .with_label_values(&[&intent.to_string()])
            .inc();
    }

    let url = format!(
        "{}/{}/{}",
        config.bridge.endpoint, config.bridge.namespace, config.operator.broker_name
    );

    debug!(
        url = &url,
        r#type = event.ty(),
        id = event.id(),
        "Forward event to the broker ingress",
    );

    let result = http
        .post(&url)
        .event(event)
        .map_err(Error::Message)?
        .send()
        .await
        .map_err(Error::Forward);

    match result {
        Ok(res) if res.status().is_success() => {
            #[cfg(feature = "metrics")]
            EVENTS_FORWARDED.with_label_values(&[RESULT_ACCEPT]).inc();

            Ok(())
        }
        Ok(res) => {
            #[cfg(feature = "metrics")]
            EVENTS_FORWARDED.with_label_values(&[RESULT_ERROR]).inc();

            Err(Error::BrokerStatus(res.status().as_u16()))
        }
        Err(err) => {
            #[cfg(feature = "metrics")]
            EVENTS_FORWARDED.with_label_values(&[RESULT_ERROR]).inc();

            Err(err)
        }
    }
}

/// account one dead-lettered event, the dead-letter channel of a binding
/// points its subscriber here so exceeded deliveries stay observable
pub fn account_dead_letter(content_type: Option<&str>, body: &[u8]) -> Result<(), Error> {
    let event = parse(content_type, body)?;

    #[cfg(feature = "metrics")]
    DLQ_DELIVERIES.inc();

    debug!(
        r#type = event.ty(),
        id = event.id(),
        "Account dead-lettered event",
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> Vec<u8> {
        serde_json::json!({
            "specversion": "1.0",
            "type": "alert.fired",
            "source": "monitoring/alertmanager",
            "id": "42",
            "time": "2026-08-01T12:00:00Z",
            "datacontenttype": "application/json",
            "data": {"severity": "critical"},
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn structured_payloads_are_accepted() {
        let event = parse(Some(STRUCTURED_CONTENT_TYPE), &body()).expect("event to parse");

        assert_eq!(event.ty(), "alert.fired");
        assert_eq!(event.id(), "42");
    }

    #[test]
    fn binary_mode_is_rejected() {
        let err = parse(Some("application/json"), &body()).expect_err("binary mode to be rejected");

        assert!(err.is_rejection());
    }

    #[test]
    fn missing_attributes_are_rejected() {
        let mut payload: serde_json::Value =
            serde_json::from_slice(&body()).expect("body to parse");
        payload.as_object_mut().expect("an object").remove("data");

        let err = parse(
            Some(STRUCTURED_CONTENT_TYPE),
            payload.to_string().as_bytes(),
        )
        .expect_err("missing data to be rejected");

        assert!(matches!(err, Error::MissingAttribute("data")));
    }

    #[test]
    fn garbage_is_rejected_not_retried() {
        let err =
            parse(Some(STRUCTURED_CONTENT_TYPE), b"{not json").expect_err("garbage to be rejected");

        assert!(err.is_rejection());
    }

    #[test]
    fn normalize_prefixes_the_type_and_stamps_provenance() {
        let config = std::sync::Arc::new(crate::svc::cfg::Configuration::test());
        let event = parse(Some(STRUCTURED_CONTENT_TYPE), &body()).expect("event to parse");

        let event = normalize(event, &config);

        assert_eq!(event.ty(), "sh.lambda.alert.fired");
        assert_eq!(
            event
                .extension(EXTENSION_ORIGIN_SOURCE)
                .map(ToString::to_string)
                .as_deref(),
            Some("monitoring/alertmanager")
        );
        assert_eq!(
            event
                .extension(EXTENSION_FORWARDED_BY)
                .map(ToString::to_string)
                .as_deref(),
            Some("lambda-operator")
        );
    }

    #[test]
    fn normalize_does_not_prefix_twice() {
        let config = std::sync::Arc::new(crate::svc::cfg::Configuration::test());
        let event = parse(Some(STRUCTURED_CONTENT_TYPE), &body()).expect("event to parse");

        let once = normalize(event, &config);
        let twice = normalize(once.to_owned(), &config);

        assert_eq!(once.ty(), twice.ty());
    }
}
