//! Deletion of a destination tag followed by removal of its manifest once no
//! other tag in the repository points at it, the way `docker rmi` untags
//! before it deletes.
//!
//! The orphan check runs in three phases: [`GarbageCollector::scan`] reads
//! the repository, [`decide`] turns the scan into a [`Decision`] and only a
//! [`Decision::Purge`] reaches the delete-by-digest act phase. Registries
//! offer no transaction across these phases; a tag created between scan and
//! act is not seen.

use crate::error::SyncError;
use crate::reference::{extract_digest, CanonicalIdentity, Reference, ValidationMode};
use crate::registry::{CallGuard, RegistryError, RegistryGateway};
use serde::Serialize;
use std::sync::Arc;

/// What happened to the manifest behind a deleted tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GcOutcome {
    /// Another tag still points at the digest
    ManifestRetained { sibling_tag: String },
    ManifestPurged,
    ManifestAlreadyAbsent,
    /// The registry cannot list tags, so the manifest is left in place
    ScanSkipped,
    /// No identity was recorded, there is no manifest to consider
    NoIdentity,
}

/// Result of reading the repository after the tag deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// `tag` resolves to the digest under consideration
    Referenced { tag: String },
    /// Every listed tag was resolved or had vanished, none matched
    Unreferenced { checked: usize, vanished: usize },
    ListingUnsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retain { sibling_tag: String },
    Skip,
    Purge,
}

pub fn decide(scan: Scan) -> Decision {
    match scan {
        Scan::Referenced { tag } => Decision::Retain { sibling_tag: tag },
        Scan::Unreferenced { .. } => Decision::Purge,
        Scan::ListingUnsupported => Decision::Skip,
    }
}

pub struct GarbageCollector {
    gateway: Arc<dyn RegistryGateway>,
}

impl GarbageCollector {
    pub fn new(gateway: Arc<dyn RegistryGateway>) -> Self {
        Self { gateway }
    }

    /// Delete `destination`, then purge the manifest named by `last_known_identity`
    /// if no remaining tag in the repository resolves to its digest.
    ///
    /// An absent tag or manifest counts as deleted. Scan failures other than a
    /// vanished tag abort before anything but the tag is deleted and surface as
    /// [`SyncError::PartialCleanup`].
    pub async fn delete_with_gc(
        &self,
        destination: &Reference,
        last_known_identity: &str,
        guard: &CallGuard,
    ) -> Result<GcOutcome, SyncError> {
        match guard
            .run("delete destination tag", self.gateway.delete(destination))
            .await
        {
            Ok(()) => tracing::info!("Deleted tag {}", destination),
            Err(RegistryError::NotFound(_)) => {
                tracing::debug!("Tag {} already absent", destination)
            }
            Err(e) => return Err(e.into()),
        }

        if extract_digest(last_known_identity).is_empty() {
            tracing::warn!(
                "No digest recorded for {}, skipping dangling manifest check",
                destination
            );
            return Ok(GcOutcome::NoIdentity);
        }

        let partial = |reason: String| SyncError::PartialCleanup {
            destination: destination.to_string(),
            identity: last_known_identity.to_string(),
            reason,
        };

        let identity =
            CanonicalIdentity::parse_with(last_known_identity, ValidationMode::Permissive)
                .map_err(|e| partial(e.to_string()))?;
        if !identity.belongs_to(destination) {
            return Err(partial(format!(
                "identity belongs to repository {}",
                identity.repository()
            )));
        }
        let digest = identity.digest();

        let scan = match self.scan(destination, digest, guard).await {
            Ok(scan) => scan,
            Err(RegistryError::Cancelled(what)) => return Err(SyncError::Cancelled(what)),
            Err(e) => {
                let err = partial(e.to_string());
                tracing::warn!("{}", err);
                return Err(err);
            }
        };

        match decide(scan) {
            Decision::Retain { sibling_tag } => {
                tracing::info!(
                    "Keeping manifest {}, still referenced by tag {}",
                    digest,
                    sibling_tag
                );
                Ok(GcOutcome::ManifestRetained { sibling_tag })
            }
            Decision::Skip => {
                tracing::warn!(
                    "{} cannot list tags, leaving manifest {} in place",
                    destination.registry(),
                    digest
                );
                Ok(GcOutcome::ScanSkipped)
            }
            Decision::Purge => self.purge(&destination.with_digest(digest), guard).await,
        }
    }

    /// Resolve every tag left in the repository of `destination`, stopping at the
    /// first one that points at `digest`.
    pub async fn scan(
        &self,
        destination: &Reference,
        digest: &str,
        guard: &CallGuard,
    ) -> Result<Scan, RegistryError> {
        let tags = match guard
            .run("list tags", self.gateway.list_tags(destination))
            .await
        {
            Ok(tags) => tags,
            Err(RegistryError::Unsupported { .. }) => return Ok(Scan::ListingUnsupported),
            Err(RegistryError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut checked = 0;
        let mut vanished = 0;
        for tag in tags {
            let sibling = destination.with_tag(&tag);
            match guard
                .run("resolve sibling digest", self.gateway.digest(&sibling))
                .await
            {
                Ok(sibling_digest) if sibling_digest == digest => {
                    return Ok(Scan::Referenced { tag })
                }
                Ok(_) => checked += 1,
                // A tag that no longer exists cannot keep the manifest alive
                Err(RegistryError::NotFound(_)) => vanished += 1,
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            "No tag in {} references {} ({} checked, {} vanished)",
            destination.repository_name(),
            digest,
            checked,
            vanished
        );
        Ok(Scan::Unreferenced { checked, vanished })
    }

    async fn purge(&self, manifest: &Reference, guard: &CallGuard) -> Result<GcOutcome, SyncError> {
        guard.check("purge manifest")?;
        match guard
            .run("delete manifest", self.gateway.delete(manifest))
            .await
        {
            Ok(()) => {
                tracing::info!("Purged dangling manifest {}", manifest);
                Ok(GcOutcome::ManifestPurged)
            }
            Err(RegistryError::NotFound(_)) => Ok(GcOutcome::ManifestAlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }
}
