pub mod drift;
pub mod gc;

pub use drift::{DriftDetector, DriftReport};
pub use gc::{GarbageCollector, GcOutcome};

use crate::error::SyncError;
use crate::reference::{identity, InvalidReference, Reference, ValidationMode};
use crate::registry::{CallGuard, RegistryError, RegistryGateway};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// State of one mirrored image as handed back to whoever persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub source: String,
    pub destination: String,
    /// Digest the source resolved to when it was last copied
    pub source_digest: String,
    /// Canonical identity of the destination (`registry/repository@digest`)
    pub id: String,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Source content is unchanged, the record was refreshed from the destination
    Refreshed { record: SyncRecord },
    /// Source content is unchanged but the destination no longer exists
    DestinationMissing,
    /// Source content changed; the destination has to be recreated
    ReplaceRequired { new_digest: String },
}

/// Create, read, update and delete of mirrored images against a registry gateway.
pub struct SyncEngine {
    gateway: Arc<dyn RegistryGateway>,
    timeout: Option<Duration>,
    require_pinned_source: bool,
}

impl SyncEngine {
    pub fn new(gateway: Arc<dyn RegistryGateway>) -> Self {
        Self {
            gateway,
            timeout: None,
            require_pinned_source: false,
        }
    }

    pub fn from_settings(gateway: Arc<dyn RegistryGateway>, settings: &Settings) -> Self {
        Self::new(gateway)
            .with_timeout(Duration::from_secs(settings.registry.timeout_secs))
            .with_pinned_sources(settings.sync.require_pinned_source)
    }

    /// Deadline applied to every individual registry call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject sources that are not digest-qualified
    pub fn with_pinned_sources(mut self, required: bool) -> Self {
        self.require_pinned_source = required;
        self
    }

    pub fn gateway(&self) -> Arc<dyn RegistryGateway> {
        self.gateway.clone()
    }

    /// Guard applying this engine's deadline and `cancel` to registry calls
    pub fn call_guard(&self, cancel: &CancellationToken) -> CallGuard {
        CallGuard::new(cancel.clone(), self.timeout)
    }

    fn parse_source(&self, source: &str) -> Result<Reference, InvalidReference> {
        let reference = Reference::parse(source, ValidationMode::Strict)?;
        if self.require_pinned_source && reference.digest().is_none() {
            return Err(InvalidReference::new(
                source,
                "source must be pinned by digest",
            ));
        }
        Ok(reference)
    }

    fn parse_destination(destination: &str) -> Result<Reference, InvalidReference> {
        let reference = Reference::parse(destination, ValidationMode::Strict)?;
        if reference.digest().is_some() {
            return Err(InvalidReference::new(
                destination,
                "destination must be a tag, not a digest",
            ));
        }
        Ok(reference)
    }

    /// Copy `source` to `destination` and return the resulting record.
    pub async fn create(
        &self,
        source: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncRecord, SyncError> {
        let source_ref = self.parse_source(source)?;
        let destination_ref = Self::parse_destination(destination)?;
        let guard = self.call_guard(cancel);

        let image = match guard
            .run("pull source", self.gateway.get(&source_ref))
            .await
        {
            Ok(image) => image,
            Err(RegistryError::NotFound(_)) => {
                return Err(SyncError::SourceNotFound(source.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        guard
            .run(
                "push destination",
                self.gateway.write(&destination_ref, &image),
            )
            .await?;
        tracing::info!(
            "Synced {} to {} ({})",
            source,
            destination,
            image.digest()
        );

        let id = self
            .read(destination, cancel)
            .await?
            .ok_or_else(|| SyncError::DestinationVanished(destination.to_string()))?;

        Ok(SyncRecord {
            source: source.to_string(),
            destination: destination.to_string(),
            source_digest: image.digest().to_string(),
            id,
            synced_at: Utc::now(),
        })
    }

    /// Canonical identity of `destination`, or None when it no longer exists.
    pub async fn read(
        &self,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SyncError> {
        let destination_ref = Self::parse_destination(destination)?;
        let guard = self.call_guard(cancel);

        match guard
            .run("resolve destination", self.gateway.digest(&destination_ref))
            .await
        {
            Ok(digest) => Ok(Some(identity::canonical_identity_for_digest(
                destination,
                &digest,
            )?)),
            Err(RegistryError::NotFound(_)) => {
                tracing::debug!("Destination {} not present in remote", destination);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-point `record` at `new_source`.
    ///
    /// When the new source still resolves to the recorded digest nothing is
    /// copied and the record is only refreshed from the destination.
    pub async fn update(
        &self,
        record: &SyncRecord,
        new_source: &str,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, SyncError> {
        self.parse_source(new_source)?;
        let detector = DriftDetector::new(self.gateway.clone());
        let report = detector
            .has_drifted(new_source, &record.source_digest, &self.call_guard(cancel))
            .await?;

        if report.drifted {
            return Ok(UpdateOutcome::ReplaceRequired {
                new_digest: report.new_digest,
            });
        }

        Ok(match self.read(&record.destination, cancel).await? {
            Some(id) => UpdateOutcome::Refreshed {
                record: SyncRecord {
                    source: new_source.to_string(),
                    id,
                    ..record.clone()
                },
            },
            None => UpdateOutcome::DestinationMissing,
        })
    }

    /// Tear down `record` and sync `new_source` into the same destination.
    ///
    /// A cleanup that could not decide about the old manifest does not stop the
    /// resync; the leak is logged.
    pub async fn replace(
        &self,
        record: &SyncRecord,
        new_source: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncRecord, SyncError> {
        match self.delete(&record.destination, &record.id, cancel).await {
            Ok(outcome) => tracing::debug!("Old destination cleanup: {:?}", outcome),
            Err(e) if e.is_partial_cleanup() => tracing::warn!("{}", e),
            Err(e) => return Err(e),
        }
        self.create(new_source, &record.destination, cancel).await
    }

    /// Delete `destination` and purge its manifest if nothing else references it.
    pub async fn delete(
        &self,
        destination: &str,
        last_known_identity: &str,
        cancel: &CancellationToken,
    ) -> Result<GcOutcome, SyncError> {
        let destination_ref = Self::parse_destination(destination)?;
        GarbageCollector::new(self.gateway.clone())
            .delete_with_gc(&destination_ref, last_known_identity, &self.call_guard(cancel))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Blob, Image, MemoryRegistry};

    fn image(seed: &str) -> Image {
        let layer = Blob::new("application/vnd.oci.image.layer.v1.tar", seed.as_bytes().to_vec());
        let manifest = format!(r#"{{"schemaVersion":2,"layers":[{{"digest":"{}"}}]}}"#, layer.digest);
        Image::new(manifest.into_bytes(), "application/vnd.oci.image.manifest.v1+json", vec![layer])
    }

    async fn seed(registry: &MemoryRegistry, reference: &str, img: &Image) {
        let reference = Reference::parse(reference, ValidationMode::Strict).unwrap();
        registry.write(&reference, img).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_copies_and_resolves_identity() {
        let registry = Arc::new(MemoryRegistry::new());
        let img = image("a");
        seed(&registry, "src.local/library/blah:v1", &img).await;
        let engine = SyncEngine::new(registry.clone());
        let cancel = CancellationToken::new();

        let source = format!("src.local/library/blah@{}", img.digest());
        let record = engine.create(&source, "dst.local/blah:v1", &cancel).await.unwrap();

        assert_eq!(record.source, source);
        assert_eq!(record.destination, "dst.local/blah:v1");
        assert_eq!(record.source_digest, img.digest());
        assert_eq!(record.id, format!("dst.local/blah@{}", img.digest()));

        let copied = registry
            .get(&Reference::parse("dst.local/blah:v1", ValidationMode::Strict).unwrap())
            .await
            .unwrap();
        assert_eq!(copied.blobs(), img.blobs());
    }

    #[tokio::test]
    async fn test_create_from_missing_source() {
        let engine = SyncEngine::new(Arc::new(MemoryRegistry::new()));
        let source = "src.local/v2/blah@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let err = engine
            .create(source, "dst.local/blah:bad_tag", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(ref s) if s == source));
        assert!(err.to_string().contains("not present in remote"));
    }

    #[tokio::test]
    async fn test_create_validates_references() {
        let registry = Arc::new(MemoryRegistry::new());
        let img = image("a");
        seed(&registry, "src.local/app:v1", &img).await;
        let cancel = CancellationToken::new();

        let engine = SyncEngine::new(registry.clone());
        let pinned_destination = format!("dst.local/app@{}", img.digest());
        assert!(matches!(
            engine.create("src.local/app:v1", &pinned_destination, &cancel).await,
            Err(SyncError::InvalidReference(_))
        ));
        assert!(matches!(
            engine.create("src.local/app", "dst.local/app:v1", &cancel).await,
            Err(SyncError::InvalidReference(_))
        ));

        let strict = SyncEngine::new(registry).with_pinned_sources(true);
        assert!(matches!(
            strict.create("src.local/app:v1", "dst.local/app:v1", &cancel).await,
            Err(SyncError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_read_absent_destination_is_not_an_error() {
        let engine = SyncEngine::new(Arc::new(MemoryRegistry::new()));
        let id = engine
            .read("dst.local/blah:v1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn test_update_without_drift_is_a_read() {
        let registry = Arc::new(MemoryRegistry::new());
        let img = image("a");
        seed(&registry, "src.local/app:v1", &img).await;
        seed(&registry, "src.local/app:stable", &img).await;
        let engine = SyncEngine::new(registry.clone());
        let cancel = CancellationToken::new();

        let record = engine
            .create("src.local/app:v1", "dst.local/app:v1", &cancel)
            .await
            .unwrap();
        let outcome = engine
            .update(&record, "src.local/app:stable", &cancel)
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Refreshed { record: refreshed } => {
                assert_eq!(refreshed.source, "src.local/app:stable");
                assert_eq!(refreshed.id, record.id);
                assert_eq!(refreshed.source_digest, record.source_digest);
                assert_eq!(refreshed.synced_at, record.synced_at);
            }
            other => panic!("expected refresh, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_with_drift_requires_replace() {
        let registry = Arc::new(MemoryRegistry::new());
        let old = image("a");
        let new = image("b");
        seed(&registry, "src.local/app:v1", &old).await;
        seed(&registry, "src.local/app:v2", &new).await;
        let engine = SyncEngine::new(registry.clone());
        let cancel = CancellationToken::new();

        let record = engine
            .create("src.local/app:v1", "dst.local/app:v1", &cancel)
            .await
            .unwrap();
        let outcome = engine.update(&record, "src.local/app:v2", &cancel).await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::ReplaceRequired {
                new_digest: new.digest().to_string()
            }
        );

        let replaced = engine.replace(&record, "src.local/app:v2", &cancel).await.unwrap();
        assert_eq!(replaced.id, format!("dst.local/app@{}", new.digest()));
        assert!(registry
            .get(&Reference::parse(&record.id, ValidationMode::Strict).unwrap())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_update_with_missing_destination() {
        let registry = Arc::new(MemoryRegistry::new());
        let img = image("a");
        seed(&registry, "src.local/app:v1", &img).await;
        let engine = SyncEngine::new(registry.clone());
        let cancel = CancellationToken::new();

        let record = engine
            .create("src.local/app:v1", "dst.local/app:v1", &cancel)
            .await
            .unwrap();
        registry
            .delete(&Reference::parse("dst.local/app:v1", ValidationMode::Strict).unwrap())
            .await
            .unwrap();

        let outcome = engine.update(&record, "src.local/app:v1", &cancel).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::DestinationMissing);
    }

    #[tokio::test]
    async fn test_cancelled_create_writes_nothing() {
        let registry = Arc::new(MemoryRegistry::new());
        let img = image("a");
        seed(&registry, "src.local/app:v1", &img).await;
        let engine = SyncEngine::new(registry.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.create("src.local/app:v1", "dst.local/app:v1", &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
        assert!(engine
            .read("dst.local/app:v1", &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }
}
