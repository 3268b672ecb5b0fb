//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_BUILD_NAMESPACE: &str = "lambda-builds";
pub const OPERATOR_BROKER_NAME: &str = "default";
pub const OPERATOR_REQUEUE_SECONDS: u64 = 15;
pub const OPERATOR_DEADLINE_SECONDS: u64 = 120;
pub const OPERATOR_CONVERGE_TIMEOUT_SECONDS: u64 = 600;
pub const OPERATOR_LEASE_NAME: &str = "lambda-operator-leader";
pub const OPERATOR_LEASE_DURATION_SECONDS: i32 = 15;
pub const BUILD_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.23.2";
pub const BUILD_MAX_ATTEMPTS: u32 = 3;
pub const BUILD_RETENTION: usize = 5;
pub const BUILD_CONCURRENCY_CAP: usize = 4;
pub const STORAGE_REGION: &str = "us-east-1";
pub const STORAGE_INLINE_SIZE_CAP: usize = 1_048_576;
pub const STORAGE_MAX_ATTEMPTS: u32 = 5;
pub const BRIDGE_ENDPOINT: &str =
    "http://broker-ingress.knative-eventing.svc.cluster.local";
pub const BRIDGE_NAMESPACE: &str = "default";
pub const BRIDGE_TYPE_PREFIX: &str = "sh.lambda.";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
    #[serde(rename = "buildNamespace")]
    pub build_namespace: String,
    #[serde(rename = "brokerName")]
    pub broker_name: String,
    #[serde(rename = "requeueSeconds")]
    pub requeue_seconds: u64,
    #[serde(rename = "deadlineSeconds")]
    pub deadline_seconds: u64,
    #[serde(rename = "convergeTimeoutSeconds")]
    pub converge_timeout_seconds: u64,
    #[serde(rename = "leaseName")]
    pub lease_name: String,
    #[serde(rename = "leaseDurationSeconds")]
    pub lease_duration_seconds: i32,
}

// -----------------------------------------------------------------------------
// Build structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Build {
    #[serde(rename = "image")]
    pub image: String,
    #[serde(rename = "registry")]
    pub registry: String,
    #[serde(rename = "serviceAccount")]
    pub service_account: String,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(rename = "retention")]
    pub retention: usize,
    #[serde(rename = "concurrencyCap")]
    pub concurrency_cap: usize,
}

// -----------------------------------------------------------------------------
// Storage structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Storage {
    #[serde(rename = "endpoint")]
    pub endpoint: Option<String>,
    #[serde(rename = "region")]
    pub region: String,
    #[serde(rename = "bucket")]
    pub bucket: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "inlineSizeCap")]
    pub inline_size_cap: usize,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
}

// -----------------------------------------------------------------------------
// Bridge structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Bridge {
    #[serde(rename = "endpoint")]
    pub endpoint: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "typePrefix")]
    pub type_prefix: String,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Sentry structure

#[cfg(feature = "tracker")]
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Sentry {
    #[serde(rename = "dsn")]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[cfg(feature = "trace")]
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Jaeger {
    pub endpoint: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "build")]
    pub build: Build,
    #[serde(rename = "storage")]
    pub storage: Storage,
    #[serde(rename = "bridge")]
    pub bridge: Bridge,
    #[cfg(feature = "tracker")]
    #[serde(rename = "sentry", default = "Default::default")]
    pub sentry: Sentry,
    #[cfg(feature = "trace")]
    #[serde(rename = "jaeger")]
    pub jaeger: Option<Jaeger>,
}

/// apply defaults for every configuration key on the given builder
fn defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, Error> {
    builder
        .set_default("operator.listen", OPERATOR_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("operator.buildNamespace", OPERATOR_BUILD_NAMESPACE)
        .map_err(|err| Error::Default("operator.buildNamespace".into(), err))?
        .set_default("operator.brokerName", OPERATOR_BROKER_NAME)
        .map_err(|err| Error::Default("operator.brokerName".into(), err))?
        .set_default("operator.requeueSeconds", OPERATOR_REQUEUE_SECONDS)
        .map_err(|err| Error::Default("operator.requeueSeconds".into(), err))?
        .set_default("operator.deadlineSeconds", OPERATOR_DEADLINE_SECONDS)
        .map_err(|err| Error::Default("operator.deadlineSeconds".into(), err))?
        .set_default(
            "operator.convergeTimeoutSeconds",
            OPERATOR_CONVERGE_TIMEOUT_SECONDS,
        )
        .map_err(|err| Error::Default("operator.convergeTimeoutSeconds".into(), err))?
        .set_default("operator.leaseName", OPERATOR_LEASE_NAME)
        .map_err(|err| Error::Default("operator.leaseName".into(), err))?
        .set_default(
            "operator.leaseDurationSeconds",
            OPERATOR_LEASE_DURATION_SECONDS as i64,
        )
        .map_err(|err| Error::Default("operator.leaseDurationSeconds".into(), err))?
        .set_default("build.image", BUILD_IMAGE)
        .map_err(|err| Error::Default("build.image".into(), err))?
        .set_default("build.registry", "")
        .map_err(|err| Error::Default("build.registry".into(), err))?
        .set_default("build.serviceAccount", "lambda-builder")
        .map_err(|err| Error::Default("build.serviceAccount".into(), err))?
        .set_default("build.maxAttempts", BUILD_MAX_ATTEMPTS as i64)
        .map_err(|err| Error::Default("build.maxAttempts".into(), err))?
        .set_default("build.retention", BUILD_RETENTION as i64)
        .map_err(|err| Error::Default("build.retention".into(), err))?
        .set_default("build.concurrencyCap", BUILD_CONCURRENCY_CAP as i64)
        .map_err(|err| Error::Default("build.concurrencyCap".into(), err))?
        .set_default("storage.region", STORAGE_REGION)
        .map_err(|err| Error::Default("storage.region".into(), err))?
        .set_default("storage.bucket", "")
        .map_err(|err| Error::Default("storage.bucket".into(), err))?
        .set_default("storage.accessKey", "")
        .map_err(|err| Error::Default("storage.accessKey".into(), err))?
        .set_default("storage.secretKey", "")
        .map_err(|err| Error::Default("storage.secretKey".into(), err))?
        .set_default("storage.inlineSizeCap", STORAGE_INLINE_SIZE_CAP as i64)
        .map_err(|err| Error::Default("storage.inlineSizeCap".into(), err))?
        .set_default("storage.maxAttempts", STORAGE_MAX_ATTEMPTS as i64)
        .map_err(|err| Error::Default("storage.maxAttempts".into(), err))?
        .set_default("bridge.endpoint", BRIDGE_ENDPOINT)
        .map_err(|err| Error::Default("bridge.endpoint".into(), err))?
        .set_default("bridge.namespace", BRIDGE_NAMESPACE)
        .map_err(|err| Error::Default("bridge.namespace".into(), err))?
        .set_default("bridge.typePrefix", BRIDGE_TYPE_PREFIX)
        .map_err(|err| Error::Default("bridge.typePrefix".into(), err))
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn try_default() -> Result<Self, Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.local/share/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// Prints a message about missing value for configuration key
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        info!("Build with 'metrics' feature flag");

        #[cfg(feature = "trace")]
        info!("Build with 'trace' feature flag");

        #[cfg(feature = "tracker")]
        info!("Build with 'tracker' feature flag");

        if self.build.registry.is_empty() {
            warn!("Configuration key 'build.registry' has an empty value, built images cannot be pushed");
        }

        if self.storage.bucket.is_empty() {
            warn!("Configuration key 'storage.bucket' has an empty value, function sources cannot be fetched");
        }

        if self.storage.access_key.is_empty() {
            warn!("Configuration key 'storage.accessKey' has an empty value");
        }

        if self.storage.secret_key.is_empty() {
            warn!("Configuration key 'storage.secretKey' has an empty value");
        }
    }
}

#[cfg(test)]
impl Configuration {
    /// in-memory fixture shared by module tests, defaults plus the keys that
    /// have no sensible default
    pub(crate) fn test() -> Self {
        defaults(Config::builder())
            .expect("defaults to apply")
            .set_override("build.registry", "registry.lambda.sh")
            .expect("override to apply")
            .set_override("storage.bucket", "lambda-sources")
            .expect("override to apply")
            .build()
            .expect("configuration to build")
            .try_deserialize()
            .expect("configuration to deserialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_a_complete_configuration() {
        let config: Configuration = defaults(Config::builder())
            .expect("defaults to apply")
            .build()
            .expect("configuration to build")
            .try_deserialize()
            .expect("configuration to deserialize");

        assert_eq!(config.operator.listen, OPERATOR_LISTEN);
        assert_eq!(config.operator.build_namespace, OPERATOR_BUILD_NAMESPACE);
        assert_eq!(config.build.retention, BUILD_RETENTION);
        assert_eq!(config.build.max_attempts, BUILD_MAX_ATTEMPTS);
        assert_eq!(config.storage.inline_size_cap, STORAGE_INLINE_SIZE_CAP);
        assert!(config.storage.endpoint.is_none());
        assert_eq!(config.bridge.type_prefix, BRIDGE_TYPE_PREFIX);
    }
}
