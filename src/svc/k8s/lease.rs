//! # Lease module
//!
//! This module provide leader election backed by the kubernetes
//! coordination/v1 lease api, a single replica holds the lease and runs the
//! reconcilers while standbys wait for it to expire

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api,
};
use tracing::{debug, info};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("lost leadership lease '{0}' to '{1}'")]
    Lost(String, String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

// -----------------------------------------------------------------------------
// Elector structure

#[derive(Clone)]
pub struct Elector {
    api: Api<Lease>,
    name: String,
    identity: String,
    duration_seconds: i32,
}

impl Elector {
    pub fn new(client: kube::Client, name: &str, identity: &str, duration_seconds: i32) -> Self {
        Self {
            api: Api::default_namespaced(client),
            name: name.to_string(),
            identity: identity.to_string(),
            duration_seconds,
        }
    }

    /// block until the lease is held by this instance
    pub async fn acquire(&self) -> Result<(), Error> {
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }

            tokio::time::sleep(self.interval()).await;
        }
    }

    /// renew the lease forever, returns an error when the leadership is lost
    /// to another instance
    pub async fn renew(&self) -> Result<(), Error> {
        loop {
            tokio::time::sleep(self.interval()).await;

            if !self.try_acquire().await? {
                let holder = self
                    .api
                    .get_opt(&self.name)
                    .await?
                    .and_then(|lease| lease.spec.and_then(|spec| spec.holder_identity))
                    .unwrap_or_else(|| "<none>".to_string());

                return Err(Error::Lost(self.name.to_owned(), holder));
            }
        }
    }

    /// give the lease up so a standby does not have to wait for expiration
    pub async fn release(&self) -> Result<(), Error> {
        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            return Ok(());
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.to_owned());

        if holder.as_deref() != Some(&self.identity) {
            return Ok(());
        }

        lease.spec = Some(LeaseSpec {
            lease_transitions: lease.spec.and_then(|spec| spec.lease_transitions),
            ..Default::default()
        });

        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = &self.name, "Released leadership lease");
                Ok(())
            }
            // another instance already took over, nothing left to release
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    /// claim the lease when it is absent, held by us or expired. Optimistic
    /// concurrency comes from the resource version carried by the replace
    /// request, a conflict means another instance won the claim
    async fn try_acquire(&self) -> Result<bool, Error> {
        let now = Utc::now();

        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.to_owned()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.to_owned()),
                    lease_duration_seconds: Some(self.duration_seconds),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(1),
                    ..Default::default()
                }),
            };

            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(err) => Err(Error::Kube(err)),
            };
        };

        let spec = lease.spec.take().unwrap_or_default();
        let holder = spec.holder_identity.to_owned();
        let held_by_us = holder.as_deref() == Some(&self.identity);

        let expired = match &spec.renew_time {
            Some(MicroTime(renewed)) => {
                let duration = spec
                    .lease_duration_seconds
                    .unwrap_or(self.duration_seconds);

                *renewed + chrono::Duration::seconds(duration as i64) < now
            }
            None => true,
        };

        if !held_by_us && !expired {
            debug!(
                lease = &self.name,
                holder = holder.unwrap_or_else(|| "<none>".to_string()),
                "Leadership lease is held by another instance",
            );

            return Ok(false);
        }

        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.to_owned()),
            lease_duration_seconds: Some(self.duration_seconds),
            acquire_time: if held_by_us {
                spec.acquire_time.to_owned()
            } else {
                Some(MicroTime(now))
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: if held_by_us {
                spec.lease_transitions
            } else {
                Some(spec.lease_transitions.unwrap_or(0) + 1)
            },
            ..Default::default()
        });

        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs((self.duration_seconds as u64 / 3).max(1))
    }
}
