//! Interfaces to the parts of the device the reconciler drives but does not own.
//!
//! The container engine, image store, network and volume drivers, the
//! dependent-device subsystem and persistent storage are all reached through
//! these traits. In-process implementations live in [`crate::memory`].

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{AppId, ComposeApp, ContainerIds, Image, ImageId, Network, Service, Volume};
use crate::step::Step;

/// Containers of the device.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Every managed container, as a service.
    async fn all(&self) -> Result<Vec<Service>>;

    /// Service name to container id for one app.
    async fn container_ids(&self, app_id: AppId) -> Result<ContainerIds>;

    /// Stop and remove a container.
    async fn kill(&self, service: &Service) -> Result<()>;

    /// Stop a container, keeping it.
    async fn stop(&self, service: &Service) -> Result<()>;

    /// Remove a dead container.
    async fn remove(&self, service: &Service) -> Result<()>;

    /// Create (if needed) and start a container; returns its id.
    async fn start(&self, service: &Service) -> Result<String>;

    /// Start `target` next to `current`, then retire `current`.
    async fn handover(&self, current: &Service, target: &Service, timeout: Option<u64>)
        -> Result<()>;

    /// Relabel a container with new release and image ids.
    async fn update_metadata(&self, current: &Service, target: &Service) -> Result<()>;
}

/// Local image store.
#[async_trait]
pub trait ImageManager: Send + Sync {
    /// Images present locally.
    async fn available(&self) -> Result<Vec<Image>>;

    /// Ids of images being downloaded.
    async fn downloading_image_ids(&self) -> Result<Vec<ImageId>>;

    /// Whether dangling images should be cleaned up.
    async fn is_cleanup_needed(&self) -> Result<bool>;

    /// Download an image, as a delta from `delta_source` when given.
    async fn fetch(&self, image: &Image, delta_source: Option<&str>) -> Result<()>;

    /// Record an image that is present but untracked.
    async fn save(&self, image: &Image) -> Result<()>;

    /// Delete an image.
    async fn remove(&self, image: &Image) -> Result<()>;

    /// Delete dangling images.
    async fn cleanup(&self) -> Result<()>;

    /// Every known image with its status and download progress.
    async fn all_statuses(&self) -> Result<Vec<Image>>;
}

/// Network driver.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Every app network.
    async fn all(&self) -> Result<Vec<Network>>;

    /// Whether the network that exposes the supervisor API exists.
    async fn supervisor_network_ready(&self) -> Result<bool>;

    /// Create the supervisor network.
    async fn ensure_supervisor_network(&self) -> Result<()>;

    /// Create a network.
    async fn create(&self, network: &Network) -> Result<()>;

    /// Remove a network.
    async fn remove(&self, network: &Network) -> Result<()>;
}

/// Volume driver.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Every app volume.
    async fn all(&self) -> Result<Vec<Volume>>;

    /// Create a volume.
    async fn create(&self, volume: &Volume) -> Result<()>;

    /// Remove a volume.
    async fn remove(&self, volume: &Volume) -> Result<()>;
}

/// The dependent-device subsystem.
#[async_trait]
pub trait DependentDevices: Send + Sync {
    /// Image names in use by dependent devices.
    async fn images_in_use(&self) -> Result<Vec<String>>;

    /// Steps the subsystem needs, given the steps the device takes this pass.
    async fn required_steps(
        &self,
        available: &[Image],
        downloading: &[ImageId],
        steps: &[Step],
    ) -> Result<Vec<Step>>;

    /// Action names the subsystem can execute.
    async fn valid_actions(&self) -> Result<Vec<String>>;

    /// Execute one of its steps.
    async fn execute(&self, step: &Step) -> Result<()>;
}

/// Per-app record of the running commit.
#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Commit currently running for `app_id`.
    async fn current_commit(&self, app_id: AppId) -> Result<Option<String>>;

    /// Record the running commit.
    async fn set_current_commit(&self, app_id: AppId, commit: &str) -> Result<()>;
}

/// Persistent target state.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// The stored target apps.
    async fn target_apps(&self) -> Result<BTreeMap<AppId, ComposeApp>>;

    /// Replace the stored target apps.
    async fn set_target_apps(&self, apps: BTreeMap<AppId, ComposeApp>) -> Result<()>;
}
