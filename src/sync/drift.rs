use crate::error::SyncError;
use crate::reference::{Reference, ValidationMode};
use crate::registry::{CallGuard, RegistryError, RegistryGateway};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub drifted: bool,
    pub new_digest: String,
}

/// Decides whether a changed source reference needs a full resync.
///
/// A source may be re-tagged or promoted without its content changing; only a
/// different manifest digest counts as drift.
pub struct DriftDetector {
    gateway: Arc<dyn RegistryGateway>,
}

impl DriftDetector {
    pub fn new(gateway: Arc<dyn RegistryGateway>) -> Self {
        Self { gateway }
    }

    pub async fn has_drifted(
        &self,
        source: &str,
        last_known_digest: &str,
        guard: &CallGuard,
    ) -> Result<DriftReport, SyncError> {
        let reference = Reference::parse(source, ValidationMode::Strict)?;

        let new_digest = match guard
            .run("resolve source digest", self.gateway.digest(&reference))
            .await
        {
            Ok(digest) => digest,
            Err(RegistryError::NotFound(_)) => {
                return Err(SyncError::SourceNotFound(source.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let drifted = new_digest != last_known_digest;
        if drifted {
            tracing::info!(
                "Source {} drifted from {} to {}",
                source,
                last_known_digest,
                new_digest
            );
        } else {
            tracing::debug!("Source {} still resolves to {}", source, new_digest);
        }

        Ok(DriftReport {
            drifted,
            new_digest,
        })
    }
}
