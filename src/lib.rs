pub mod error;
pub mod reference;
pub mod registry;
pub mod settings;
pub mod sync;


use anyhow::Result;
use registry::{CredentialChain, OciGateway};
use std::sync::Arc;
use sync::SyncEngine;
use tracing::info;

/// Build a sync engine talking to real registries as configured by `settings`
pub fn engine_from_settings(settings: &settings::Settings) -> Result<SyncEngine> {
    let credentials = CredentialChain::from_settings(&settings.credentials);
    let gateway = OciGateway::new(&settings.registry, credentials)?;
    info!(
        "Registry gateway ready (timeout: {}s, insecure hosts: {:?})",
        settings.registry.timeout_secs, settings.registry.insecure_hosts
    );
    Ok(SyncEngine::from_settings(Arc::new(gateway), settings))
}
