//! Device and target files.
//!
//! A device file describes what an engine currently holds:
//!
//! ```json
//! {
//!   "services": [{ "appId": 1, "serviceId": 1, "serviceName": "main", ... }],
//!   "images": [],
//!   "networks": [],
//!   "volumes": [],
//!   "downloading": [],
//!   "cleanupNeeded": false,
//!   "supervisorNetwork": true,
//!   "commits": { "1": "abc123" }
//! }
//! ```
//!
//! A target file maps app ids to compose-like app records.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stevedore_reconciler::model::parse_app_id;
use stevedore_reconciler::{
    CommitStore, ComposeApp, Image, ImageId, InMemoryCommitStore, InMemoryEngine, Network,
    Service, Volume,
};

/// Contents of a device file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSnapshot {
    pub services: Vec<Service>,
    pub images: Vec<Image>,
    pub networks: Vec<Network>,
    pub volumes: Vec<Volume>,
    /// Image ids with a download in flight.
    pub downloading: Vec<ImageId>,
    pub cleanup_needed: bool,
    pub supervisor_network: bool,
    /// Current commit per app id.
    pub commits: BTreeMap<String, String>,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            images: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
            downloading: Vec::new(),
            cleanup_needed: false,
            supervisor_network: true,
            commits: BTreeMap::new(),
        }
    }
}

/// Target app records keyed by app id.
pub type TargetFile = BTreeMap<String, ComposeApp>;

/// Read and deserialize a JSON file.
///
/// # Errors
///
/// Returns `FileReadFailed` if the file cannot be read and
/// `JsonParseFailed` if its contents do not match `T`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> stevedore_core::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| stevedore_core::Error::file_read_failed(path, e.to_string()))?;
    Ok(serde_json::from_str(&raw)?)
}

impl DeviceSnapshot {
    /// Load a device file.
    ///
    /// # Errors
    ///
    /// See [`load_json`].
    pub fn load(path: &Path) -> stevedore_core::Result<Self> {
        load_json(path)
    }

    /// An engine holding this snapshot.
    pub async fn engine(&self) -> InMemoryEngine {
        let engine = if self.supervisor_network {
            InMemoryEngine::ready()
        } else {
            InMemoryEngine::new()
        };
        engine.add_services(self.services.iter().cloned()).await;
        engine.add_images(self.images.iter().cloned()).await;
        engine.add_networks(self.networks.iter().cloned()).await;
        engine.add_volumes(self.volumes.iter().cloned()).await;
        engine.set_downloading(self.downloading.clone()).await;
        engine.set_cleanup_needed(self.cleanup_needed).await;
        engine
    }

    /// A commit store holding this snapshot's commits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAppId` for a commit keyed by something other than an
    /// integer.
    pub async fn commit_store(&self) -> stevedore_reconciler::Result<InMemoryCommitStore> {
        let store = InMemoryCommitStore::new();
        for (key, commit) in &self.commits {
            store.set_current_commit(parse_app_id(key)?, commit).await?;
        }
        Ok(store)
    }
}

/// Load a target file.
///
/// # Errors
///
/// See [`load_json`].
pub fn load_target(path: &Path) -> stevedore_core::Result<TargetFile> {
    load_json(path)
}
