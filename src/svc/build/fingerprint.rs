//! # Fingerprint module
//!
//! This module provide the content-addressed identity of a build artifact.
//! Two sources producing the same fingerprint are guaranteed to produce the
//! same image, which is what makes build coalescing and digest caching sound.

use std::fmt::{self, Display, Formatter};

use sha2::{Digest, Sha256};

use crate::svc::{build::wrapper, crd::Language};

// -----------------------------------------------------------------------------
// Fingerprint structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct Fingerprint(String);

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Fingerprint {
    /// shortened form used in child resource names
    pub fn short(&self) -> &str {
        &self.0[..16]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// rebuild a fingerprint from a label value recorded on a build job
    pub fn from_hex(hex: &str) -> Self {
        Self(hex.to_string())
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// compute the fingerprint of a prospective build, a sha256 over the
/// length-prefixed source bytes, language, runtime version, wrapper version
/// and entrypoint. Length prefixes keep field boundaries unambiguous.
pub fn compute(source: &[u8], language: Language, version: &str, entrypoint: &str) -> Fingerprint {
    let mut hasher = Sha256::new();

    for field in [
        source,
        language.to_string().as_bytes(),
        version.as_bytes(),
        wrapper::WRAPPER_VERSION.as_bytes(),
        entrypoint.as_bytes(),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }

    Fingerprint(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &[u8] = b"def handler(event, context):\n    return {'ok': True}\n";

    #[test]
    fn equal_inputs_give_equal_fingerprints() {
        let a = compute(SOURCE, Language::Python, "3.12", "handler");
        let b = compute(SOURCE, Language::Python, "3.12", "handler");

        assert_eq!(a, b);
    }

    #[test]
    fn every_field_participates() {
        let base = compute(SOURCE, Language::Python, "3.12", "handler");

        assert_ne!(base, compute(b"other", Language::Python, "3.12", "handler"));
        assert_ne!(base, compute(SOURCE, Language::Node, "3.12", "handler"));
        assert_ne!(base, compute(SOURCE, Language::Python, "3.11", "handler"));
        assert_ne!(base, compute(SOURCE, Language::Python, "3.12", "main"));
    }

    #[test]
    fn fingerprint_is_hex_encoded_sha256() {
        let fingerprint = compute(SOURCE, Language::Python, "3.12", "handler");

        assert_eq!(fingerprint.to_string().len(), 64);
        assert_eq!(fingerprint.short().len(), 16);
        assert!(fingerprint.to_string().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
