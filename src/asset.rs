//! Assets: the read-only targets terminals and tunnels are opened against
//!
//! Assets are owned by an external store; the engine only ever reads them
//! through [`AssetStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LocalShellConfig;
use crate::ssh::SshConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target: AssetTarget,
}

/// What an asset points at
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetTarget {
    /// A shell on this machine; `shell` overrides the engine-wide default
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<LocalShellConfig>,
    },
    /// A remote host reached over SSH
    Ssh(SshConfig),
}

impl Asset {
    pub fn local(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            target: AssetTarget::Local { shell: None },
        }
    }

    pub fn ssh(id: impl Into<String>, config: SshConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            target: AssetTarget::Ssh(config),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, AssetTarget::Local { .. })
    }

    pub fn ssh_config(&self) -> Option<&SshConfig> {
        match &self.target {
            AssetTarget::Ssh(config) => Some(config),
            AssetTarget::Local { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AssetStoreError {
    #[error("Asset store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only asset lookup
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, AssetStoreError>;
}

/// In-memory store for embedding and tests
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: DashMap<String, Asset>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = Asset>) -> Self {
        let store = Self::new();
        for asset in assets {
            store.insert(asset);
        }
        store
    }

    pub fn insert(&self, asset: Asset) {
        self.assets.insert(asset.id.clone(), asset);
    }

    pub fn remove(&self, id: &str) -> Option<Asset> {
        self.assets.remove(id).map(|(_, asset)| asset)
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, AssetStoreError> {
        Ok(self.assets.get(id).map(|entry| entry.value().clone()))
    }
}
