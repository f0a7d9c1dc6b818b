//! Content-addressed identities of synced images.

use super::{extract_digest, is_digest, InvalidReference, Reference, ValidationMode};
use crate::registry::Image;
use std::fmt;
use std::str::FromStr;

/// Canonical identity of a synced image: `registry/repository@digest`.
///
/// Two identities are equal iff they name the same repository and the same
/// digest, whichever tag they were resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalIdentity {
    repository: String,
    digest: String,
}

impl CanonicalIdentity {
    pub fn parse(identity: &str) -> Result<Self, InvalidReference> {
        Self::parse_with(identity, ValidationMode::Strict)
    }

    /// Parse under `mode`; a digest is required either way.
    pub fn parse_with(identity: &str, mode: ValidationMode) -> Result<Self, InvalidReference> {
        let reference = Reference::parse(identity, mode)?;
        let digest = reference
            .digest()
            .ok_or_else(|| InvalidReference::new(identity, "identity must carry a digest"))?;
        Ok(Self {
            repository: reference.repository_name(),
            digest: digest.to_string(),
        })
    }

    /// `registry/repository` part of the identity
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Whether the identity lives in the repository `reference` points into
    pub fn belongs_to(&self, reference: &Reference) -> bool {
        self.repository == reference.repository_name()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CanonicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

impl FromStr for CanonicalIdentity {
    type Err = InvalidReference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Resolve `reference` to `repository@digest` using the digest of the image that
/// was just fetched from it.
///
/// A reference that already ends in a well-formed digest is returned unchanged,
/// so applying this to its own output is a no-op. Otherwise any tag is dropped
/// and the fetched digest appended; a digest embedded in the input is never
/// trusted over the fetched one.
pub fn canonical_identity(reference: &str, image: &Image) -> Result<String, InvalidReference> {
    canonical_identity_for_digest(reference, image.digest())
}

/// Like [`canonical_identity`] but for a digest resolved without pulling the
/// whole image.
pub fn canonical_identity_for_digest(
    reference: &str,
    digest: &str,
) -> Result<String, InvalidReference> {
    let parsed = Reference::parse(reference, ValidationMode::Strict)?;

    if is_digest(extract_digest(reference)) {
        return Ok(reference.to_string());
    }
    if !is_digest(digest) {
        return Err(InvalidReference::new(digest, "not a valid digest"));
    }

    Ok(format!("{}@{}", parsed.repository_name(), digest))
}
