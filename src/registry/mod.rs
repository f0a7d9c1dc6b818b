pub mod credentials;
pub mod memory;
pub mod oci;

pub use credentials::{CredentialChain, CredentialsProvider, HostMatcher, RegistryCredentials};
pub use memory::MemoryRegistry;
pub use oci::OciGateway;

use crate::reference::Reference;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures reported by a [`RegistryGateway`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("'{0}' not present in remote")]
    NotFound(String),

    #[error("registry {registry} does not support {operation}")]
    Unsupported {
        registry: String,
        operation: &'static str,
    },

    #[error("registry error: {0}")]
    Transport(String),

    #[error("registry call cancelled: {0}")]
    Cancelled(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

/// A content blob (config or layer) referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            digest: sha256_digest(&data),
            media_type: media_type.into(),
            data,
        }
    }
}

/// Image content as fetched from a registry.
///
/// The digest is always derived from the raw manifest bytes, so the same
/// manifest yields the same digest in every registry it is copied to.
#[derive(Debug, Clone)]
pub struct Image {
    manifest: Vec<u8>,
    media_type: String,
    digest: String,
    blobs: Vec<Blob>,
}

impl Image {
    pub fn new(manifest: Vec<u8>, media_type: impl Into<String>, blobs: Vec<Blob>) -> Self {
        Self {
            digest: sha256_digest(&manifest),
            manifest,
            media_type: media_type.into(),
            blobs,
        }
    }

    /// Raw manifest bytes, pushed verbatim on write
    pub fn manifest(&self) -> &[u8] {
        &self.manifest
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// `sha256:<hex>` of the manifest
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Access to a remote registry.
///
/// Implementations report a missing tag or digest as [`RegistryError::NotFound`]
/// and a registry that cannot enumerate tags as [`RegistryError::Unsupported`];
/// callers decide what either means for them.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Fetch the manifest selected by `reference` together with its blobs
    async fn get(&self, reference: &Reference) -> Result<Image, RegistryError>;

    /// Digest of the manifest selected by `reference`
    async fn digest(&self, reference: &Reference) -> Result<String, RegistryError> {
        Ok(self.get(reference).await?.digest().to_string())
    }

    /// Upload blobs and manifest, tagging it when `reference` carries a tag
    async fn write(&self, reference: &Reference, image: &Image) -> Result<(), RegistryError>;

    /// All tags in the repository of `reference`
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, RegistryError>;

    /// Delete the tag or manifest selected by `reference`
    async fn delete(&self, reference: &Reference) -> Result<(), RegistryError>;
}

/// Races every gateway call against a cancellation signal and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CallGuard {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl CallGuard {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`RegistryError::Cancelled`] if cancellation was already requested
    pub fn check(&self, what: &str) -> Result<(), RegistryError> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled(what.to_string()));
        }
        Ok(())
    }

    pub async fn run<T, F>(&self, what: &str, call: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, RegistryError>>,
    {
        self.check(what)?;

        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                    RegistryError::Cancelled(format!("{} exceeded deadline of {:?}", what, limit))
                })?,
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RegistryError::Cancelled(what.to_string())),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_derived_from_manifest() {
        let a = Image::new(b"{}".to_vec(), "application/json", Vec::new());
        let b = Image::new(
            b"{}".to_vec(),
            "application/json",
            vec![Blob::new("application/octet-stream", b"layer".to_vec())],
        );
        assert_eq!(a.digest(), b.digest());
        assert_eq!(
            a.digest(),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let guard = CallGuard::default();
        let value = guard.run("noop", async { Ok::<_, RegistryError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_rejects_after_cancel() {
        let cancel = CancellationToken::new();
        let guard = CallGuard::new(cancel.clone(), None);
        cancel.cancel();
        let result = guard.run("get", async { Ok::<_, RegistryError>(()) }).await;
        assert!(matches!(result, Err(RegistryError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_guard_enforces_deadline() {
        let guard = CallGuard::new(CancellationToken::new(), Some(Duration::from_millis(10)));
        let result = guard
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RegistryError>(())
            })
            .await;
        assert!(matches!(result, Err(RegistryError::Cancelled(_))));
    }
}
