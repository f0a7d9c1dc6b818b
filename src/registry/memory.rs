//! In-memory registry.
//!
//! Content-addressed like a real distribution registry: manifests are stored
//! by digest and tags point at digests. Deleting a tag leaves the manifest in
//! place, deleting a manifest by digest drops every tag still pointing at it.

use super::{Image, RegistryError, RegistryGateway};
use crate::reference::Reference;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct Repository {
    manifests: HashMap<String, Image>,
    tags: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    repositories: Mutex<HashMap<String, Repository>>,
    tag_listing_disabled: bool,
    deletions: Mutex<Vec<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers tag listing with [`RegistryError::Unsupported`]
    pub fn without_tag_listing() -> Self {
        Self {
            tag_listing_disabled: true,
            ..Self::default()
        }
    }

    /// Every reference passed to a successful `delete`, in call order
    pub fn deletions(&self) -> Vec<String> {
        self.deletions
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Repository>>, RegistryError> {
        self.repositories
            .lock()
            .map_err(|_| RegistryError::Transport("in-memory registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl RegistryGateway for MemoryRegistry {
    async fn get(&self, reference: &Reference) -> Result<Image, RegistryError> {
        let repositories = self.lock()?;
        let not_found = || RegistryError::NotFound(reference.to_string());
        let repository = repositories
            .get(&reference.repository_name())
            .ok_or_else(not_found)?;

        let digest = match reference.digest() {
            Some(digest) => digest,
            None => repository
                .tags
                .get(reference.identifier())
                .map(String::as_str)
                .ok_or_else(not_found)?,
        };

        repository.manifests.get(digest).cloned().ok_or_else(not_found)
    }

    async fn write(&self, reference: &Reference, image: &Image) -> Result<(), RegistryError> {
        if let Some(digest) = reference.digest() {
            if digest != image.digest() {
                return Err(RegistryError::Transport(format!(
                    "manifest digest {} does not match reference {}",
                    image.digest(),
                    reference
                )));
            }
        }

        let mut repositories = self.lock()?;
        let repository = repositories.entry(reference.repository_name()).or_default();
        repository
            .manifests
            .insert(image.digest().to_string(), image.clone());
        if let Some(tag) = reference.tag() {
            repository
                .tags
                .insert(tag.to_string(), image.digest().to_string());
        }
        Ok(())
    }

    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, RegistryError> {
        if self.tag_listing_disabled {
            return Err(RegistryError::Unsupported {
                registry: reference.registry().to_string(),
                operation: "tag listing",
            });
        }

        let repositories = self.lock()?;
        repositories
            .get(&reference.repository_name())
            .map(|repository| repository.tags.keys().cloned().collect())
            .ok_or_else(|| RegistryError::NotFound(reference.repository_name()))
    }

    async fn delete(&self, reference: &Reference) -> Result<(), RegistryError> {
        let mut repositories = self.lock()?;
        let not_found = || RegistryError::NotFound(reference.to_string());
        let repository = repositories
            .get_mut(&reference.repository_name())
            .ok_or_else(not_found)?;

        match reference.digest() {
            Some(digest) => {
                repository.manifests.remove(digest).ok_or_else(not_found)?;
                repository.tags.retain(|_, tagged| tagged.as_str() != digest);
            }
            None => {
                repository
                    .tags
                    .remove(reference.identifier())
                    .ok_or_else(not_found)?;
            }
        }
        drop(repositories);

        if let Ok(mut deletions) = self.deletions.lock() {
            deletions.push(reference.to_string());
        }
        Ok(())
    }
}
