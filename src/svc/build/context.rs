//! # Context module
//!
//! This module assembles the build context of a fingerprint, a gzipped
//! tarball carrying the user source verbatim under /src, the runtime wrapper
//! under /wrapper and the declarative build descriptor at /BUILD, then
//! uploads it to the object storage for the builder job to consume

use std::{io, sync::Arc};

use aws_sdk_s3::{
    error::SdkError, operation::put_object::PutObjectError, primitives::ByteStream,
};
use flate2::{write::GzEncoder, Compression};
use tracing::debug;

use crate::svc::{
    build::{fingerprint::Fingerprint, wrapper},
    cfg::Configuration,
    crd::Language,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to append entry '{0}' to build context archive, {1}")]
    Append(String, io::Error),
    #[error("failed to finish build context archive, {0}")]
    Finish(io::Error),
    #[error("failed to upload build context 's3://{0}/{1}', {2}")]
    Upload(String, String, SdkError<PutObjectError>),
}

// -----------------------------------------------------------------------------
// Helper functions

/// object key of the context tarball of the given fingerprint
pub fn key(fingerprint: &Fingerprint) -> String {
    format!("contexts/{fingerprint}.tar.gz")
}

/// assemble the gzipped build context in memory. Entry metadata is pinned so
/// the archive bytes only depend on its content
pub fn assemble(
    language: Language,
    entrypoint: &str,
    main_path: &str,
    source: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut archive = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    let mut entries = vec![(
        format!("src/{main_path}"),
        source.to_vec(),
    )];

    for (path, content) in wrapper::files(language) {
        entries.push((path.to_string(), content.as_bytes().to_vec()));
    }

    entries.push((
        "BUILD".to_string(),
        wrapper::build_descriptor(language, entrypoint).into_bytes(),
    ));

    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();

        archive
            .append_data(&mut header, &path, content.as_slice())
            .map_err(|err| Error::Append(path, err))?;
    }

    archive
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(Error::Finish)
}

/// upload the context tarball and returns the url given to the builder job
pub async fn upload(
    storage: &aws_sdk_s3::Client,
    config: &Arc<Configuration>,
    fingerprint: &Fingerprint,
    bytes: Vec<u8>,
) -> Result<String, Error> {
    let bucket = &config.storage.bucket;
    let key = key(fingerprint);

    debug!(
        bucket = bucket,
        key = &key,
        size = bytes.len(),
        "Upload build context to object storage",
    );

    storage
        .put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from(bytes))
        .send()
        .await
        .map_err(|err| Error::Upload(bucket.to_owned(), key.to_owned(), err))?;

    Ok(format!("s3://{bucket}/{key}"))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn context_carries_source_wrapper_and_descriptor() {
        let bytes = assemble(
            Language::Python,
            "handler",
            "main.py",
            b"def handler(event, context):\n    return {'ok': True}\n",
        )
        .expect("context to assemble");

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let paths = archive
            .entries()
            .expect("archive to list entries")
            .map(|entry| {
                entry
                    .expect("entry to be readable")
                    .path()
                    .expect("entry to have a path")
                    .to_string_lossy()
                    .to_string()
            })
            .collect::<Vec<_>>();

        assert_eq!(paths, vec!["src/main.py", "wrapper/main.py", "BUILD"]);
    }

    #[test]
    fn context_assembly_is_deterministic() {
        let source = b"module.exports.handler = async () => ({});\n";

        let first = assemble(Language::Node, "handler", "index.js", source)
            .expect("context to assemble");
        let second = assemble(Language::Node, "handler", "index.js", source)
            .expect("context to assemble");

        assert_eq!(first, second);
    }

    #[test]
    fn descriptor_is_readable_from_the_archive() {
        let bytes = assemble(Language::Go, "Handle", "main.go", b"package src\n")
            .expect("context to assemble");

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut descriptor = String::new();

        for entry in archive.entries().expect("archive to list entries") {
            let mut entry = entry.expect("entry to be readable");
            if entry.path().expect("entry to have a path").ends_with("BUILD") {
                entry
                    .read_to_string(&mut descriptor)
                    .expect("descriptor to be utf-8");
            }
        }

        assert!(descriptor.contains("entrypoint: Handle"));
        assert!(descriptor.contains("baseImage: golang:1.22-alpine"));
    }
}
