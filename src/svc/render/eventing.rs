//! # Eventing renderer module
//!
//! This module renders the event bindings of a workload, one knative trigger
//! per subscribed event type and the optional dead-letter channel shared by
//! all of them

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::svc::{
    knative::{
        eventing::{DeliverySpec, Trigger, TriggerFilter, TriggerSpec},
        messaging::{Channel, ChannelSpec, REPLAY_CURSOR_ANNOTATION, RETENTION_ANNOTATION},
        Destination, Reference,
    },
    render::Workload,
};

// -----------------------------------------------------------------------------
// Helper functions

/// turn an event type into a DNS-1123 compatible name fragment
pub fn slug(event_type: &str) -> String {
    let slug = event_type
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();

    slug.trim_matches('-').chars().take(40).collect()
}

pub fn dlq_name(workload: &Workload) -> String {
    format!("{}-dlq", workload.name)
}

/// render the dead-letter channel of the workload, if one is asked for
pub fn dlq(workload: &Workload) -> Option<Channel> {
    let policy = workload.eventing.dead_letter.as_ref()?;

    Some(Channel {
        metadata: ObjectMeta {
            name: Some(dlq_name(workload)),
            namespace: Some(workload.namespace.to_owned()),
            labels: Some(workload.labels()),
            annotations: Some(BTreeMap::from([
                (RETENTION_ANNOTATION.to_string(), policy.retention.to_owned()),
                (REPLAY_CURSOR_ANNOTATION.to_string(), "0".to_string()),
            ])),
            owner_references: Some(vec![workload.owner.to_owned()]),
            ..Default::default()
        },
        spec: ChannelSpec { delivery: None },
        status: None,
    })
}

/// render one trigger per subscribed event type, each filtering on the exact
/// type and pointing to the runtime service, with the dead-letter sink wired
/// when a channel exists
pub fn triggers(workload: &Workload, dlq: Option<&Channel>) -> Vec<Trigger> {
    workload
        .eventing
        .subscribed_event_types
        .iter()
        .map(|event_type| {
            let delivery = workload.eventing.dead_letter.as_ref().map(|policy| {
                DeliverySpec {
                    dead_letter_sink: dlq.map(|channel| Destination {
                        r#ref: Some(Reference {
                            api_version: "messaging.knative.dev/v1".to_string(),
                            kind: "Channel".to_string(),
                            name: channel
                                .metadata
                                .name
                                .to_owned()
                                .unwrap_or_else(|| dlq_name(workload)),
                            namespace: None,
                        }),
                        uri: None,
                    }),
                    retry: Some(policy.max_deliveries),
                    backoff_policy: Some("exponential".to_string()),
                    backoff_delay: Some("PT1S".to_string()),
                }
            });

            Trigger {
                metadata: ObjectMeta {
                    name: Some(format!("{}-{}", workload.name, slug(event_type))),
                    namespace: Some(workload.namespace.to_owned()),
                    labels: Some(workload.labels()),
                    owner_references: Some(vec![workload.owner.to_owned()]),
                    ..Default::default()
                },
                spec: TriggerSpec {
                    broker: workload.broker.to_owned(),
                    filter: Some(TriggerFilter {
                        attributes: BTreeMap::from([(
                            "type".to_string(),
                            event_type.to_owned(),
                        )]),
                    }),
                    subscriber: Destination {
                        r#ref: Some(Reference {
                            api_version: "serving.knative.dev/v1".to_string(),
                            kind: "Service".to_string(),
                            name: workload.name.to_owned(),
                            namespace: None,
                        }),
                        uri: None,
                    },
                    delivery,
                },
                status: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::svc::{crd::DeadLetterPolicy, render::tests::workload};

    use super::*;

    #[test]
    fn slug_flattens_event_types() {
        assert_eq!(slug("com.example.Order.Created"), "com-example-order-created");
        assert_eq!(slug("--trimmed--"), "trimmed");
    }

    #[test]
    fn triggers_filter_on_the_exact_event_type() {
        let workload = workload();
        let triggers = triggers(&workload, None);

        assert_eq!(triggers.len(), 1);
        assert_eq!(
            triggers[0]
                .spec
                .filter
                .as_ref()
                .expect("trigger to carry a filter")
                .attributes
                .get("type")
                .map(String::as_str),
            Some("com.example.order.created")
        );
        assert!(triggers[0].spec.delivery.is_none());
    }

    #[test]
    fn dead_letter_policy_renders_a_channel_and_wires_the_sink() {
        let mut workload = workload();
        workload.eventing.dead_letter = Some(DeadLetterPolicy {
            retention: "168h".to_string(),
            max_deliveries: 5,
        });

        let channel = dlq(&workload).expect("a dead-letter channel to be rendered");
        assert_eq!(channel.metadata.name.as_deref(), Some("hello-dlq"));
        assert_eq!(
            channel
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(RETENTION_ANNOTATION))
                .map(String::as_str),
            Some("168h")
        );

        let triggers = triggers(&workload, Some(&channel));
        let delivery = triggers[0]
            .spec
            .delivery
            .as_ref()
            .expect("trigger to carry a delivery spec");

        assert_eq!(delivery.retry, Some(5));
        assert_eq!(
            delivery
                .dead_letter_sink
                .as_ref()
                .and_then(|sink| sink.r#ref.as_ref())
                .map(|r| r.name.as_str()),
            Some("hello-dlq")
        );
    }
}
