//! # Cache module
//!
//! This module provide the image digest cache, a process singleton mapping
//! fingerprints to built artifacts. Entries are inserted with compare-and-swap
//! semantics so concurrent reconciles of the same fingerprint agree on a
//! single digest. The cluster is the backing store, the cache rehydrates from
//! succeeded build jobs at startup.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::{api::ListParams, Api};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::svc::{
    build,
    cfg::Configuration,
    crd::now,
    render::FINGERPRINT_LABEL,
};

// -----------------------------------------------------------------------------
// Entry structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Entry {
    pub digest: Option<String>,
    pub built_at: Option<String>,
    pub source_ref: String,
    pub attempts: u32,
}

// -----------------------------------------------------------------------------
// Cache structure

#[derive(Clone, Default, Debug)]
pub struct Cache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Cache {
    /// returns the cached digest of the given fingerprint, if a build already
    /// succeeded for it
    pub async fn digest(&self, fingerprint: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(fingerprint)
            .and_then(|entry| entry.digest.to_owned())
    }

    pub async fn attempts(&self, fingerprint: &str) -> u32 {
        self.inner
            .read()
            .await
            .get(fingerprint)
            .map(|entry| entry.attempts)
            .unwrap_or(0)
    }

    /// record a successful build. The first writer wins, a concurrent
    /// reconcile recording a digest for an already-filled entry observes the
    /// existing one, which keeps invariant of a single digest per fingerprint
    pub async fn record_success(
        &self,
        fingerprint: &str,
        digest: &str,
        source_ref: &str,
    ) -> String {
        let mut inner = self.inner.write().await;

        let entry = inner.entry(fingerprint.to_string()).or_insert_with(|| Entry {
            digest: None,
            built_at: None,
            source_ref: source_ref.to_string(),
            attempts: 0,
        });

        match &entry.digest {
            Some(existing) => existing.to_owned(),
            None => {
                entry.digest = Some(digest.to_string());
                entry.built_at = Some(now());
                digest.to_string()
            }
        }
    }

    /// record a failed build attempt and returns the attempt count
    pub async fn record_failure(&self, fingerprint: &str, source_ref: &str) -> u32 {
        let mut inner = self.inner.write().await;

        let entry = inner.entry(fingerprint.to_string()).or_insert_with(|| Entry {
            digest: None,
            built_at: None,
            source_ref: source_ref.to_string(),
            attempts: 0,
        });

        entry.attempts += 1;
        entry.attempts
    }

    pub async fn forget(&self, fingerprint: &str) {
        self.inner.write().await.remove(fingerprint);
    }

    /// drop every successful entry beyond the `keep` most recent ones, unless
    /// its digest is still referenced by a live runtime service. Returns the
    /// evicted fingerprints so their build jobs can be pruned as well
    pub async fn retain(&self, keep: usize, referenced: &HashSet<String>) -> Vec<String> {
        let mut inner = self.inner.write().await;

        let mut successful = inner
            .iter()
            .filter_map(|(fingerprint, entry)| {
                entry
                    .built_at
                    .as_ref()
                    .map(|built_at| (fingerprint.to_owned(), built_at.to_owned()))
            })
            .collect::<Vec<_>>();

        // rfc3339 timestamps in utc order lexicographically, newest last
        successful.sort_by(|a, b| a.1.cmp(&b.1));

        let excess = successful.len().saturating_sub(keep);
        let mut evicted = vec![];

        for (fingerprint, _) in successful.into_iter().take(excess) {
            let in_use = inner
                .get(&fingerprint)
                .and_then(|entry| entry.digest.as_ref())
                .map(|digest| referenced.contains(digest))
                .unwrap_or(false);

            if !in_use {
                inner.remove(&fingerprint);
                evicted.push(fingerprint);
            }
        }

        evicted
    }

    /// rebuild the cache from the succeeded fingerprint-labelled jobs of the
    /// build namespace, reading each digest back from its builder pod
    pub async fn rehydrate(
        &self,
        kube: &kube::Client,
        config: &Arc<Configuration>,
    ) -> Result<usize, kube::Error> {
        let namespace = &config.operator.build_namespace;
        let jobs: Api<Job> = Api::namespaced(kube.to_owned(), namespace);
        let pods: Api<Pod> = Api::namespaced(kube.to_owned(), namespace);

        let params = ListParams::default().labels(FINGERPRINT_LABEL);
        let mut restored = 0;

        for job in jobs.list(&params).await? {
            let succeeded = job
                .status
                .as_ref()
                .and_then(|status| status.succeeded)
                .unwrap_or(0)
                > 0;

            if !succeeded {
                continue;
            }

            let Some(fingerprint) = job
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(FINGERPRINT_LABEL))
            else {
                continue;
            };

            let selector = format!("{FINGERPRINT_LABEL}={fingerprint}");
            let digest = pods
                .list(&ListParams::default().labels(&selector))
                .await?
                .items
                .iter()
                .find_map(build::digest_from_pod);

            if let Some(digest) = digest {
                debug!(
                    fingerprint = fingerprint,
                    digest = &digest,
                    "Restore digest cache entry from succeeded build job",
                );

                self.record_success(fingerprint, &digest, &format!("job:{namespace}"))
                    .await;
                restored += 1;
            }
        }

        info!(
            restored = restored,
            namespace = namespace,
            "Rehydrated image digest cache from the build namespace",
        );

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_recorded_digest_wins() {
        let cache = Cache::default();

        let first = cache.record_success("fp", "sha256:aaa", "inline:python").await;
        let second = cache.record_success("fp", "sha256:bbb", "inline:python").await;

        assert_eq!(first, "sha256:aaa");
        assert_eq!(second, "sha256:aaa");
        assert_eq!(cache.digest("fp").await.as_deref(), Some("sha256:aaa"));
    }

    #[tokio::test]
    async fn failures_accumulate_until_forgotten() {
        let cache = Cache::default();

        assert_eq!(cache.record_failure("fp", "inline:python").await, 1);
        assert_eq!(cache.record_failure("fp", "inline:python").await, 2);
        assert_eq!(cache.attempts("fp").await, 2);

        cache.forget("fp").await;
        assert_eq!(cache.attempts("fp").await, 0);
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_and_the_referenced() {
        let cache = Cache::default();

        for i in 0..4 {
            cache
                .record_success(&format!("fp{i}"), &format!("sha256:{i}"), "inline:python")
                .await;

            // built_at granularity is one second, spread entries apart
            if let Some(entry) = cache.inner.write().await.get_mut(&format!("fp{i}")) {
                entry.built_at = Some(format!("2026-01-0{}T00:00:00Z", i + 1));
            }
        }

        let referenced = HashSet::from(["sha256:0".to_string()]);
        let evicted = cache.retain(2, &referenced).await;

        // fp0 is the oldest but referenced, fp1 is evicted, fp2 and fp3 kept
        assert_eq!(evicted, vec!["fp1".to_string()]);
        assert_eq!(cache.digest("fp0").await.as_deref(), Some("sha256:0"));
        assert!(cache.digest("fp1").await.is_none());
        assert_eq!(cache.digest("fp3").await.as_deref(), Some("sha256:3"));
    }
}
