//! In-process collaborators.
//!
//! [`InMemoryEngine`] simulates a container engine with its image store,
//! networks and volumes. Applying a step changes what the engine reports on
//! the next read, so a full reconciliation can be driven without a real
//! engine. The other types are trivial stores.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::collaborators::{
    CommitStore, DependentDevices, ImageManager, NetworkManager, ServiceManager, TargetStore,
    VolumeManager,
};
use crate::error::{Error, Result};
use crate::model::{
    AppId, ComposeApp, ContainerIds, Image, ImageId, Network, Service, ServiceStatus, Volume,
};
use crate::step::Step;

#[derive(Debug, Default)]
struct EngineState {
    services: Vec<Service>,
    images: Vec<Image>,
    downloading: Vec<ImageId>,
    networks: Vec<Network>,
    volumes: Vec<Volume>,
    supervisor_network: bool,
    cleanup_needed: bool,
    next_container: u64,
    fetches: Vec<(String, Option<String>)>,
}

impl EngineState {
    fn position(&self, service: &Service) -> Option<usize> {
        self.services.iter().position(|s| match &service.container_id {
            Some(id) => s.container_id.as_deref() == Some(id.as_str()),
            None => s.app_id == service.app_id && s.service_id == service.service_id,
        })
    }

    fn create_container(&mut self, target: &Service) -> Service {
        self.next_container = self.next_container.saturating_add(1);
        let running = target.config.running;
        Service {
            container_id: Some(format!("container-{}", self.next_container)),
            status: if running {
                ServiceStatus::Running
            } else {
                ServiceStatus::Installed
            },
            created_at: Some(Utc::now()),
            ..target.clone()
        }
    }
}

fn not_found(operation: &str, what: &str) -> Error {
    Error::collaborator(operation, format!("{what} not found"))
}

/// Simulated engine.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    state: RwLock<EngineState>,
}

impl InMemoryEngine {
    /// An engine with nothing on it and no supervisor network.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose supervisor network already exists.
    pub fn ready() -> Self {
        Self {
            state: RwLock::new(EngineState {
                supervisor_network: true,
                ..EngineState::default()
            }),
        }
    }

    /// Seed containers.
    pub async fn add_services(&self, services: impl IntoIterator<Item = Service>) {
        self.state.write().await.services.extend(services);
    }

    /// Seed images.
    pub async fn add_images(&self, images: impl IntoIterator<Item = Image>) {
        self.state.write().await.images.extend(images);
    }

    /// Seed networks.
    pub async fn add_networks(&self, networks: impl IntoIterator<Item = Network>) {
        self.state.write().await.networks.extend(networks);
    }

    /// Seed volumes.
    pub async fn add_volumes(&self, volumes: impl IntoIterator<Item = Volume>) {
        self.state.write().await.volumes.extend(volumes);
    }

    /// Mark an image as downloading.
    pub async fn set_downloading(&self, image_ids: Vec<ImageId>) {
        self.state.write().await.downloading = image_ids;
    }

    /// Flag dangling images.
    pub async fn set_cleanup_needed(&self, needed: bool) {
        self.state.write().await.cleanup_needed = needed;
    }

    /// Image names fetched so far, with the delta source used.
    pub async fn fetches(&self) -> Vec<(String, Option<String>)> {
        self.state.read().await.fetches.clone()
    }
}

#[async_trait]
impl ServiceManager for InMemoryEngine {
    async fn all(&self) -> Result<Vec<Service>> {
        Ok(self.state.read().await.services.clone())
    }

    async fn container_ids(&self, app_id: AppId) -> Result<ContainerIds> {
        Ok(self
            .state
            .read()
            .await
            .services
            .iter()
            .filter(|s| s.app_id == app_id)
            .filter_map(|s| {
                s.container_id
                    .as_ref()
                    .map(|id| (s.service_name.clone(), id.clone()))
            })
            .collect())
    }

    async fn kill(&self, service: &Service) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(service)
            .ok_or_else(|| not_found("kill", &service.service_name))?;
        state.services.remove(index);
        Ok(())
    }

    async fn stop(&self, service: &Service) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(service)
            .ok_or_else(|| not_found("stop", &service.service_name))?;
        if let Some(container) = state.services.get_mut(index) {
            container.status = ServiceStatus::Stopped;
            container.config.running = false;
        }
        Ok(())
    }

    async fn remove(&self, service: &Service) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(service)
            .ok_or_else(|| not_found("remove", &service.service_name))?;
        state.services.remove(index);
        Ok(())
    }

    async fn start(&self, service: &Service) -> Result<String> {
        let mut state = self.state.write().await;
        let existing = service
            .container_id
            .as_ref()
            .and_then(|_| state.position(service));

        match existing.and_then(|index| state.services.get_mut(index)) {
            Some(container) => {
                container.status = ServiceStatus::Running;
                container.config.running = true;
                container
                    .container_id
                    .clone()
                    .ok_or_else(|| Error::internal_inconsistency("container without id"))
            }
            None => {
                let container = state.create_container(service);
                let id = container.container_id.clone().unwrap_or_default();
                state.services.push(container);
                Ok(id)
            }
        }
    }

    async fn handover(
        &self,
        current: &Service,
        target: &Service,
        _timeout: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(current)
            .ok_or_else(|| not_found("handover", &current.service_name))?;
        let container = state.create_container(target);
        state.services.remove(index);
        state.services.push(container);
        Ok(())
    }

    async fn update_metadata(&self, current: &Service, target: &Service) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(current)
            .ok_or_else(|| not_found("updateMetadata", &current.service_name))?;
        if let Some(container) = state.services.get_mut(index) {
            container.release_id = target.release_id;
            container.image_id = target.image_id;
        }
        Ok(())
    }
}

#[async_trait]
impl ImageManager for InMemoryEngine {
    async fn available(&self) -> Result<Vec<Image>> {
        Ok(self.state.read().await.images.clone())
    }

    async fn downloading_image_ids(&self) -> Result<Vec<ImageId>> {
        Ok(self.state.read().await.downloading.clone())
    }

    async fn is_cleanup_needed(&self) -> Result<bool> {
        Ok(self.state.read().await.cleanup_needed)
    }

    async fn fetch(&self, image: &Image, delta_source: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        debug!(image = %image.name, delta_source, "Simulated fetch");
        state
            .fetches
            .push((image.name.clone(), delta_source.map(str::to_string)));
        state.images.push(Image {
            docker_image_id: Some(image.name.clone()),
            ..image.identity()
        });
        Ok(())
    }

    async fn save(&self, image: &Image) -> Result<()> {
        let mut state = self.state.write().await;
        let docker_id = state
            .images
            .iter()
            .find(|i| i.is_same_image(&image.name))
            .and_then(|i| i.docker_image_id.clone());
        state.images.push(Image {
            docker_image_id: docker_id,
            ..image.identity()
        });
        Ok(())
    }

    async fn remove(&self, image: &Image) -> Result<()> {
        let mut state = self.state.write().await;
        let identity = image.identity();
        state.images.retain(|i| i.identity() != identity);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.state.write().await.cleanup_needed = false;
        Ok(())
    }

    async fn all_statuses(&self) -> Result<Vec<Image>> {
        let state = self.state.read().await;
        Ok(state
            .images
            .iter()
            .map(|image| {
                let downloading = image
                    .image_id
                    .is_some_and(|id| state.downloading.contains(&id));
                Image {
                    status: Some(if downloading { "Downloading" } else { "Downloaded" }.to_string()),
                    ..image.clone()
                }
            })
            .collect())
    }
}

#[async_trait]
impl NetworkManager for InMemoryEngine {
    async fn all(&self) -> Result<Vec<Network>> {
        Ok(self.state.read().await.networks.clone())
    }

    async fn supervisor_network_ready(&self) -> Result<bool> {
        Ok(self.state.read().await.supervisor_network)
    }

    async fn ensure_supervisor_network(&self) -> Result<()> {
        self.state.write().await.supervisor_network = true;
        Ok(())
    }

    async fn create(&self, network: &Network) -> Result<()> {
        self.state.write().await.networks.push(network.clone());
        Ok(())
    }

    async fn remove(&self, network: &Network) -> Result<()> {
        let mut state = self.state.write().await;
        let engine_name = network.engine_name();
        state.networks.retain(|n| n.engine_name() != engine_name);
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for InMemoryEngine {
    async fn all(&self) -> Result<Vec<Volume>> {
        Ok(self.state.read().await.volumes.clone())
    }

    async fn create(&self, volume: &Volume) -> Result<()> {
        self.state.write().await.volumes.push(volume.clone());
        Ok(())
    }

    async fn remove(&self, volume: &Volume) -> Result<()> {
        let mut state = self.state.write().await;
        let engine_name = volume.engine_name();
        state.volumes.retain(|v| v.engine_name() != engine_name);
        Ok(())
    }
}

/// A device without dependent devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependentDevices;

#[async_trait]
impl DependentDevices for NoDependentDevices {
    async fn images_in_use(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn required_steps(
        &self,
        _available: &[Image],
        _downloading: &[ImageId],
        _steps: &[Step],
    ) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }

    async fn valid_actions(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn execute(&self, step: &Step) -> Result<()> {
        Err(Error::invalid_action(step.action_name()))
    }
}

/// Commits kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryCommitStore {
    commits: RwLock<BTreeMap<AppId, String>>,
}

impl InMemoryCommitStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitStore for InMemoryCommitStore {
    async fn current_commit(&self, app_id: AppId) -> Result<Option<String>> {
        Ok(self.commits.read().await.get(&app_id).cloned())
    }

    async fn set_current_commit(&self, app_id: AppId, commit: &str) -> Result<()> {
        self.commits.write().await.insert(app_id, commit.to_string());
        Ok(())
    }
}

/// Target apps kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryTargetStore {
    apps: RwLock<BTreeMap<AppId, ComposeApp>>,
}

impl InMemoryTargetStore {
    /// Create a store holding `apps`.
    pub fn new(apps: BTreeMap<AppId, ComposeApp>) -> Self {
        Self {
            apps: RwLock::new(apps),
        }
    }
}

#[async_trait]
impl TargetStore for InMemoryTargetStore {
    async fn target_apps(&self) -> Result<BTreeMap<AppId, ComposeApp>> {
        Ok(self.apps.read().await.clone())
    }

    async fn set_target_apps(&self, apps: BTreeMap<AppId, ComposeApp>) -> Result<()> {
        *self.apps.write().await = apps;
        Ok(())
    }
}
