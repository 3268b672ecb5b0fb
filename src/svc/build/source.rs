//! # Source module
//!
//! This module provide the source fetcher of the function build pipeline,
//! validating and retrieving either an object-storage reference or an inline
//! blob before fingerprinting

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStreamError,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::svc::{
    cfg::Configuration,
    crd::function::{Source, SourceType},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to check source object 's3://{0}/{1}', {2}")]
    Head(String, String, SdkError<HeadObjectError>),
    #[error("failed to retrieve source object 's3://{0}/{1}', {2}")]
    Get(String, String, SdkError<GetObjectError>),
    #[error("failed to read source object body 's3://{0}/{1}', {2}")]
    Read(String, String, ByteStreamError),
    #[error("source object checksum mismatch, expected '{expected}', computed '{computed}'")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("inline source of {size} bytes exceeds the configured cap of {cap} bytes")]
    InlineTooLarge { size: usize, cap: usize },
    #[error("source has no variant matching its declared type")]
    MissingVariant,
}

// -----------------------------------------------------------------------------
// Helper functions

/// build the object storage client from the configuration, pointing at a
/// custom endpoint when one is configured
pub async fn client(config: &Arc<Configuration>) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.storage.access_key,
        &config.storage.secret_key,
        None,
        None,
        env!("CARGO_PKG_NAME"),
    );

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.storage.region.to_owned()))
        .credentials_provider(credentials);

    if let Some(endpoint) = &config.storage.endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    let sdk = loader.load().await;
    let config = aws_sdk_s3::config::Builder::from(&sdk)
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(config)
}

/// validate and retrieve the source declared by the given spec, returns the
/// raw bytes and a reference string recorded in the digest cache
pub async fn fetch(
    storage: &aws_sdk_s3::Client,
    config: &Arc<Configuration>,
    source: &Source,
) -> Result<(Vec<u8>, String), Error> {
    match source.r#type {
        SourceType::Inline => {
            let inline = source.inline.as_ref().ok_or(Error::MissingVariant)?;
            let bytes = inline.blob.as_bytes().to_vec();

            if bytes.len() > config.storage.inline_size_cap {
                return Err(Error::InlineTooLarge {
                    size: bytes.len(),
                    cap: config.storage.inline_size_cap,
                });
            }

            Ok((bytes, format!("inline:{}", inline.language)))
        }
        SourceType::ObjectRef => {
            let object_ref = source.object_ref.as_ref().ok_or(Error::MissingVariant)?;
            let (bucket, key) = (&object_ref.bucket, &object_ref.key);

            debug!(
                bucket = bucket,
                key = key,
                "Check accessibility of source object",
            );

            storage
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| Error::Head(bucket.to_owned(), key.to_owned(), err))?;

            let object = storage
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| Error::Get(bucket.to_owned(), key.to_owned(), err))?;

            let bytes = object
                .body
                .collect()
                .await
                .map_err(|err| Error::Read(bucket.to_owned(), key.to_owned(), err))?
                .into_bytes()
                .to_vec();

            if let Some(expected) = &object_ref.checksum {
                let computed = hex::encode(Sha256::digest(&bytes));
                if &computed != expected {
                    return Err(Error::ChecksumMismatch {
                        expected: expected.to_owned(),
                        computed,
                    });
                }
            }

            Ok((bytes, format!("s3://{bucket}/{key}")))
        }
    }
}
