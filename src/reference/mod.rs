//! Registry reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1.2` or `registry.local:5000/app@sha256:...`
//! into their registry host, repository path and identifier components. No
//! normalization is applied: `docker.io/app` and `index.docker.io/app` are
//! different repositories as far as this module is concerned.

pub mod identity;

pub use identity::{canonical_identity, canonical_identity_for_digest, CanonicalIdentity};

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Registry assumed for bare repository paths under permissive validation.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag assumed for references without tag or digest under permissive validation.
pub const DEFAULT_TAG: &str = "latest";

lazy_static! {
    // https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
    static ref DIGEST_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap();
    static ref PATH_COMPONENT_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap();
    static ref HOST_RE: Regex =
        Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*(?::[0-9]+)?$")
            .unwrap();
}

/// Malformed reference input. Never worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid reference '{reference}': {reason}")]
pub struct InvalidReference {
    pub reference: String,
    pub reason: String,
}

impl InvalidReference {
    pub fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// How strictly [`Reference::parse`] treats its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Registry host and a tag or digest must be explicit, digests must be well-formed.
    Strict,
    /// Bare repository paths are accepted and default to [`DEFAULT_REGISTRY`] and
    /// [`DEFAULT_TAG`]. Only meant for best-effort operations such as orphan scans.
    Permissive,
}

/// Parsed registry reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// Supported forms:
    /// - `host/repo:tag`
    /// - `host:5000/nested/repo@sha256:abc...`
    /// - `host/repo:tag@sha256:abc...` (the digest is the identifier)
    /// - `repo` or `org/repo` under [`ValidationMode::Permissive`] only
    pub fn parse(input: &str, mode: ValidationMode) -> Result<Self, InvalidReference> {
        if input.is_empty() {
            return Err(InvalidReference::new(input, "reference is empty"));
        }
        if input.chars().any(|c| c.is_whitespace()) {
            return Err(InvalidReference::new(input, "reference contains whitespace"));
        }

        // Digest first: everything after the last '@'
        let (name_tag, digest) = match input.rfind('@') {
            Some(at) => {
                let digest = &input[at + 1..];
                if digest.is_empty() {
                    return Err(InvalidReference::new(input, "digest is empty"));
                }
                let well_formed = match mode {
                    ValidationMode::Strict => is_digest(digest),
                    ValidationMode::Permissive => digest.contains(':'),
                };
                if !well_formed {
                    return Err(InvalidReference::new(
                        input,
                        format!(
                            "digest '{}' must match '{}'",
                            digest,
                            DIGEST_RE.as_str()
                        ),
                    ));
                }
                (&input[..at], Some(digest.to_string()))
            }
            None => (input, None),
        };

        // Tag: text after the last ':' that follows the last '/'
        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            if !TAG_RE.is_match(tag) {
                return Err(InvalidReference::new(
                    input,
                    format!("tag '{}' is not a valid tag", tag),
                ));
            }
        }

        let (registry, repository) = split_registry(name);
        let registry = match registry {
            Some(registry) => {
                if registry != "localhost" && !HOST_RE.is_match(registry) {
                    return Err(InvalidReference::new(
                        input,
                        format!("registry host '{}' is not a valid host", registry),
                    ));
                }
                registry.to_string()
            }
            None if mode == ValidationMode::Strict => {
                return Err(InvalidReference::new(
                    input,
                    "strict validation requires the registry host to be explicit",
                ));
            }
            None => DEFAULT_REGISTRY.to_string(),
        };

        validate_repository(input, repository)?;

        let tag = match (tag, &digest, mode) {
            (Some(tag), _, _) => Some(tag.to_string()),
            (None, Some(_), _) => None,
            (None, None, ValidationMode::Permissive) => Some(DEFAULT_TAG.to_string()),
            (None, None, ValidationMode::Strict) => {
                return Err(InvalidReference::new(
                    input,
                    "strict validation requires a tag or digest",
                ));
            }
        };

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Registry host, including any port (e.g. `localhost:5000`)
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry (e.g. `org/app`)
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The component that selects a manifest: the digest when present, else the tag.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `registry/repository` without any identifier
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Exact host + path comparison, no normalization of ports or default registries.
    pub fn same_repository(&self, other: &Reference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }

    /// Sibling reference in the same repository, selected by tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Sibling reference in the same repository, selected by digest.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = InvalidReference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, ValidationMode::Strict)
    }
}

/// Whether `s` has the `algorithm:value` shape of a content digest.
pub fn is_digest(s: &str) -> bool {
    DIGEST_RE.is_match(s)
}

/// Everything after the last `@` of `reference`, or an empty string when there is
/// no `@` or nothing follows it.
pub fn extract_digest(reference: &str) -> &str {
    match reference.rfind('@') {
        Some(at) if at + 1 < reference.len() => &reference[at + 1..],
        _ => "",
    }
}

/// Split `name[:tag]`, only honouring a ':' that occurs after the last '/'.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let search_from = name_tag.rfind('/').map(|slash| slash + 1).unwrap_or(0);
    match name_tag[search_from..].rfind(':') {
        Some(colon) => {
            let colon = search_from + colon;
            (&name_tag[..colon], Some(&name_tag[colon + 1..]))
        }
        None => (name_tag, None),
    }
}

/// The first path component is a registry host iff it contains '.' or ':' or is `localhost`.
fn split_registry(name: &str) -> (Option<&str>, &str) {
    if let Some(slash) = name.find('/') {
        let first = &name[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (Some(first), &name[slash + 1..]);
        }
    }
    (None, name)
}

fn validate_repository(input: &str, repository: &str) -> Result<(), InvalidReference> {
    if repository.is_empty() {
        return Err(InvalidReference::new(input, "repository is empty"));
    }
    if repository.len() > 255 {
        return Err(InvalidReference::new(
            input,
            "repository must not exceed 255 characters",
        ));
    }
    for component in repository.split('/') {
        if !PATH_COMPONENT_RE.is_match(component) {
            return Err(InvalidReference::new(
                input,
                format!("repository component '{}' is not valid", component),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_parse_tagged_reference() {
        let r = Reference::parse("ghcr.io/org/app:v1.2", ValidationMode::Strict).unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "org/app");
        assert_eq!(r.tag(), Some("v1.2"));
        assert_eq!(r.digest(), None);
        assert_eq!(r.identifier(), "v1.2");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = Reference::parse("127.0.0.1:57691/blah:1.0", ValidationMode::Strict).unwrap();
        assert_eq!(r.registry(), "127.0.0.1:57691");
        assert_eq!(r.repository(), "blah");
        assert_eq!(r.tag(), Some("1.0"));
    }

    #[test]
    fn test_parse_port_without_tag_is_not_a_tag() {
        let r = Reference::parse(&format!("localhost:5000/app@{}", DIGEST), ValidationMode::Strict)
            .unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), Some(DIGEST));
    }

    #[test]
    fn test_parse_digest_takes_precedence_as_identifier() {
        let input = format!("remote.com/v2/blah:latest@{}", DIGEST);
        let r = Reference::parse(&input, ValidationMode::Strict).unwrap();
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.identifier(), DIGEST);
        assert_eq!(r.to_string(), input);
    }

    #[test]
    fn test_strict_rejects_missing_identifier() {
        let err = Reference::parse("remote.com/v2/blah", ValidationMode::Strict).unwrap_err();
        assert!(err.reason.contains("tag or digest"));
    }

    #[test]
    fn test_strict_rejects_implicit_registry() {
        assert!(Reference::parse("library/busybox:1.32", ValidationMode::Strict).is_err());
    }

    #[test]
    fn test_strict_rejects_malformed_digest() {
        assert!(Reference::parse("remote.com/blah@sha256", ValidationMode::Strict).is_err());
        assert!(Reference::parse("remote.com/blah@SHA256:abc", ValidationMode::Strict).is_err());
        assert!(Reference::parse("remote.com/blah@", ValidationMode::Strict).is_err());
    }

    #[test]
    fn test_strict_accepts_other_digest_algorithms() {
        let r = Reference::parse("remote.com/blah@sha512+b64u:abc_DEF-1=", ValidationMode::Strict)
            .unwrap();
        assert_eq!(r.digest(), Some("sha512+b64u:abc_DEF-1="));
    }

    #[test]
    fn test_permissive_defaults() {
        let r = Reference::parse("busybox", ValidationMode::Permissive).unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "busybox");
        assert_eq!(r.tag(), Some(DEFAULT_TAG));

        let r = Reference::parse("remote.com/v2/blah", ValidationMode::Permissive).unwrap();
        assert_eq!(r.registry(), "remote.com");
        assert_eq!(r.repository(), "v2/blah");
        assert_eq!(r.tag(), Some(DEFAULT_TAG));
    }

    #[test]
    fn test_rejects_invalid_repository() {
        assert!(Reference::parse("remote.com/Blah:v1", ValidationMode::Strict).is_err());
        assert!(Reference::parse("remote.com//blah:v1", ValidationMode::Strict).is_err());
        assert!(Reference::parse("remote.com/:v1", ValidationMode::Permissive).is_err());
        assert!(Reference::parse("https://remote/v2/blah:1.1.1", ValidationMode::Strict).is_err());
    }

    #[test]
    fn test_rejects_invalid_tag() {
        assert!(Reference::parse("remote.com/blah:-v1", ValidationMode::Strict).is_err());
        assert!(Reference::parse("remote.com/blah:", ValidationMode::Strict).is_err());
    }

    #[test]
    fn test_same_repository_is_exact() {
        let a = Reference::parse("remote.com/blah:v1", ValidationMode::Strict).unwrap();
        let b = Reference::parse(&format!("remote.com/blah@{}", DIGEST), ValidationMode::Strict)
            .unwrap();
        let c = Reference::parse("remote.com:443/blah:v1", ValidationMode::Strict).unwrap();
        assert!(a.same_repository(&b));
        assert!(!a.same_repository(&c));
    }

    #[test]
    fn test_siblings() {
        let r = Reference::parse("remote.com/blah:v1", ValidationMode::Strict).unwrap();
        assert_eq!(r.with_tag("latest").to_string(), "remote.com/blah:latest");
        assert_eq!(
            r.with_digest(DIGEST).to_string(),
            format!("remote.com/blah@{}", DIGEST)
        );
        assert_eq!(r.repository_name(), "remote.com/blah");
    }

    #[test]
    fn test_extract_digest() {
        assert_eq!(extract_digest("host/repo@"), "");
        assert_eq!(extract_digest("host/repo@sha256:abc"), "sha256:abc");
        assert_eq!(extract_digest("host/repo:tag"), "");
        assert_eq!(extract_digest("https://remote/v2/blah@sha256:123"), "sha256:123");
        assert_eq!(extract_digest(""), "");
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest(DIGEST));
        assert!(!is_digest("latest"));
        assert!(!is_digest("sha256:"));
    }
}
