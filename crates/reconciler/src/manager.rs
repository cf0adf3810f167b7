//! Application manager: the device-level entry point of the reconciler.
//!
//! The manager assembles the current state from the collaborators, reads
//! and normalises the stored target, infers the steps that close the gap and
//! executes them. It also owns writes of the target state, which are checked
//! against service contracts first.

use std::collections::BTreeMap;
use std::sync::Arc;

use either::Either;
use futures::future::join_all;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use stevedore_core::ResultExt;
use stevedore_events::{EventBus, StateEvent};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::collaborators::{
    CommitStore, DependentDevices, ImageManager, NetworkManager, ServiceManager, TargetStore,
    VolumeManager,
};
use crate::config::ReconcilerConfig;
use crate::contracts::{validate_target_contracts, DeviceCapabilities};
use crate::error::{Error, Result};
use crate::executor::{Collaborators, ExecuteOptions, StepExecutor};
use crate::lock::{InMemoryUpdateLock, UpdateLock};
use crate::memory::{InMemoryCommitStore, InMemoryTargetStore, NoDependentDevices};
use crate::model::{
    parse_app_id, App, AppId, ComposeApp, ImageId, ServiceConfig, ServiceId, StateSnapshot,
};
use crate::orchestrator::{infer_next_steps, ExtraState, InferenceInput};
use crate::status::{device_status, DeviceStatus};
use crate::step::{Action, Step};

/// Override of a target service that lasts until the next target write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatileOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

impl VolatileOverride {
    fn merge(&mut self, other: Self) {
        if other.running.is_some() {
            self.running = other.running;
        }
    }

    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(running) = self.running {
            config.running = running;
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassResult {
    /// Steps that completed.
    pub taken: Vec<Step>,
    /// Steps that failed, with the reason.
    pub failed: Vec<(Step, String)>,
    /// No step was needed.
    pub converged: bool,
}

impl PassResult {
    fn new(taken: Vec<Step>, failed: Vec<(Step, String)>) -> Self {
        let converged = taken.is_empty() && failed.is_empty();
        Self {
            taken,
            failed,
            converged,
        }
    }
}

/// Device-level reconciler.
pub struct ApplicationManager {
    collaborators: Collaborators,
    targets: Arc<dyn TargetStore>,
    executor: Arc<StepExecutor>,
    bus: Arc<EventBus>,
    config: ReconcilerConfig,
    capabilities: DeviceCapabilities,
    volatile: RwLock<BTreeMap<ImageId, VolatileOverride>>,
}

impl ApplicationManager {
    /// Start building a manager.
    pub fn builder() -> ApplicationManagerBuilder {
        ApplicationManagerBuilder::new()
    }

    /// The observed state, grouped by app and stamped with each app's commit.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn current_state(&self) -> Result<StateSnapshot> {
        let c = &self.collaborators;
        let services = c.services.all().await?;
        let networks = c.networks.all().await?;
        let volumes = c.volumes.all().await?;

        let mut apps: BTreeMap<AppId, App> = BTreeMap::new();
        for service in services {
            apps.entry(service.app_id)
                .or_insert_with(|| App::empty(service.app_id))
                .services
                .push(service);
        }
        for network in networks {
            apps.entry(network.app_id)
                .or_insert_with(|| App::empty(network.app_id))
                .networks
                .insert(network.name.clone(), network);
        }
        for volume in volumes {
            apps.entry(volume.app_id)
                .or_insert_with(|| App::empty(volume.app_id))
                .volumes
                .insert(volume.name.clone(), volume);
        }

        for app in apps.values_mut() {
            app.commit = c.commits.current_commit(app.app_id).await?;
        }

        Ok(StateSnapshot { apps })
    }

    /// The stored target, normalised, with volatile overrides merged in.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn target_state(&self) -> Result<StateSnapshot> {
        let records = self.targets.target_apps().await?;
        let available = self.collaborators.images.available().await?;
        let volatile = self.volatile.read().await;

        let resolve_image = |name: &str| {
            available
                .iter()
                .find(|image| image.is_same_image(name))
                .and_then(|image| image.docker_image_id.clone())
        };

        let apps = records.iter().map(|(app_id, record)| {
            let mut app = App::from_compose(*app_id, record, &resolve_image);
            for service in &mut app.services {
                if let Some(overrides) = volatile.get(&service.image_id) {
                    overrides.apply(&mut service.config);
                }
            }
            app
        });

        Ok(StateSnapshot::from_apps(apps))
    }

    /// Facts beyond the two snapshots that inference needs.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn extra_state(&self, current: &StateSnapshot) -> Result<ExtraState> {
        let c = &self.collaborators;
        let mut container_ids = BTreeMap::new();
        for app_id in current.apps.keys() {
            container_ids.insert(*app_id, c.services.container_ids(*app_id).await?);
        }

        Ok(ExtraState {
            cleanup_needed: c.images.is_cleanup_needed().await?,
            available: c.images.available().await?,
            downloading: c.images.downloading_image_ids().await?,
            supervisor_network_ready: c.networks.supervisor_network_ready().await?,
            container_ids,
            dependent_images: c.dependent.images_in_use().await.or_default_logged(Vec::new()),
        })
    }

    /// Steps needed to move `current` toward `target`, including the steps
    /// of the dependent-device subsystem.
    ///
    /// # Errors
    ///
    /// Returns `Error::FetchWhileIgnoringImages` when `ignore_images` is set
    /// and a fetch is still needed, and propagates inference and
    /// collaborator failures.
    pub async fn required_steps(
        &self,
        current: &StateSnapshot,
        target: &StateSnapshot,
        ignore_images: bool,
    ) -> Result<Vec<Step>> {
        let extra = self.extra_state(current).await?;
        let started = self.executor.started().await;

        let mut steps = infer_next_steps(&InferenceInput {
            current,
            target,
            extra: &extra,
            ignore_images,
            config: &self.config,
            started: &started,
        })?;

        if ignore_images && steps.iter().any(|step| step.action() == Action::Fetch) {
            return Err(Error::FetchWhileIgnoringImages);
        }

        let dependent = self
            .collaborators
            .dependent
            .required_steps(&extra.available, &extra.downloading, &steps)
            .await?;
        steps.extend(dependent);

        debug!(steps = steps.len(), "Inferred steps");
        Ok(steps)
    }

    /// Steps needed right now.
    ///
    /// # Errors
    ///
    /// See [`ApplicationManager::required_steps`].
    pub async fn next_steps(&self) -> Result<Vec<Step>> {
        let current = self.current_state().await?;
        let target = self.target_state().await?;
        self.required_steps(&current, &target, false).await
    }

    /// Run one pass: infer, then execute every step concurrently.
    ///
    /// Failed steps are reported in the result; the next pass recomputes
    /// from fresh state.
    ///
    /// # Errors
    ///
    /// Returns an error when the steps cannot be inferred.
    pub async fn apply_target(&self, options: ExecuteOptions) -> Result<PassResult> {
        let steps = self.next_steps().await?;
        if steps.is_empty() {
            return Ok(PassResult::new(Vec::new(), Vec::new()));
        }

        info!(steps = steps.len(), "Applying target state");
        let outcomes = join_all(steps.iter().map(|step| self.executor.execute(step, options))).await;

        let (taken, failed): (Vec<Step>, Vec<(Step, String)>) =
            steps
                .into_iter()
                .zip(outcomes)
                .partition_map(|(step, outcome)| match outcome {
                    Ok(()) => Either::Left(step),
                    Err(e) => Either::Right((step, e.to_string())),
                });

        Ok(PassResult::new(taken, failed))
    }

    /// Execute a single step.
    ///
    /// # Errors
    ///
    /// See [`StepExecutor::execute`].
    pub async fn execute_step(&self, step: &Step, options: ExecuteOptions) -> Result<()> {
        self.executor.execute(step, options).await
    }

    /// Store a new target.
    ///
    /// Apps whose contracts fail keep their previous target; every other app
    /// is stored with its optional unmet services dropped. Volatile
    /// overrides are cleared.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAppId` for a non-integer key (nothing is
    /// stored), and `Error::ContractViolation` after storing when an app was
    /// rejected.
    pub async fn set_target(&self, apps: BTreeMap<String, ComposeApp>) -> Result<()> {
        let apps = apps
            .into_iter()
            .map(|(key, app)| Ok((parse_app_id(&key)?, app)))
            .collect::<Result<BTreeMap<AppId, ComposeApp>>>()?;

        let mut checks = validate_target_contracts(&apps, &self.capabilities);
        let previous = self.targets.target_apps().await?;

        let mut stored = BTreeMap::new();
        let mut violators = BTreeMap::new();
        let mut skipped = Vec::new();

        for (app_id, mut app) in apps {
            match checks.remove(&app_id) {
                Some(check) if !check.valid => {
                    let name = app.name.clone().unwrap_or_else(|| app_id.to_string());
                    violators.insert(name, check.unmet);
                    if let Some(previous) = previous.get(&app_id) {
                        stored.insert(app_id, previous.clone());
                    }
                }
                Some(check) => {
                    app.services
                        .retain(|service| check.fulfilled.contains(&service.service_name));
                    skipped.extend(check.unmet_optional);
                    stored.insert(app_id, app);
                }
                None => {
                    stored.insert(app_id, app);
                }
            }
        }

        let app_ids = stored.keys().map(|id| id.value()).collect();
        self.targets.set_target_apps(stored).await?;
        self.volatile.write().await.clear();

        if !skipped.is_empty() {
            info!(services = ?skipped, "Optional containers with unmet contracts were skipped");
            self.bus
                .publish(StateEvent::optional_services_skipped(skipped))
                .await;
        }
        self.bus.publish(StateEvent::target_updated(app_ids)).await;

        if violators.is_empty() {
            Ok(())
        } else {
            Err(Error::ContractViolation { violators })
        }
    }

    /// Override part of a target service until the next target write.
    pub async fn set_target_volatile_for_service(
        &self,
        image_id: ImageId,
        overrides: VolatileOverride,
    ) {
        self.volatile
            .write()
            .await
            .entry(image_id)
            .or_default()
            .merge(overrides);
    }

    /// Drop overrides of the given services.
    pub async fn clear_target_volatile_for_services(&self, image_ids: &[ImageId]) {
        let mut volatile = self.volatile.write().await;
        for image_id in image_ids {
            volatile.remove(image_id);
        }
    }

    /// Kill every service on the device.
    ///
    /// # Errors
    ///
    /// Returns the first failure after every kill was attempted.
    pub async fn stop_all(&self, options: ExecuteOptions) -> Result<()> {
        let services = self.collaborators.services.all().await?;
        info!(services = services.len(), "Stopping all services");

        let steps: Vec<Step> = services
            .iter()
            .map(|service| Step::kill(service).with_app(service.app_id))
            .collect();
        let outcomes = join_all(steps.iter().map(|step| self.executor.execute(step, options))).await;

        outcomes.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Release the locks kept by steps run with
    /// [`ExecuteOptions::keep_locks`].
    pub async fn release_kept_locks(&self, app_ids: impl IntoIterator<Item = AppId>) {
        for app_id in app_ids {
            self.executor.lock().release_kept(app_id).await;
        }
    }

    /// Name of a target service by id.
    ///
    /// # Errors
    ///
    /// Propagates target store failures.
    pub async fn service_name_from_id(&self, service_id: ServiceId) -> Result<Option<String>> {
        let apps = self.targets.target_apps().await?;
        Ok(apps
            .values()
            .flat_map(|app| app.services.iter())
            .find(|service| service.service_id == service_id)
            .map(|service| service.service_name.clone()))
    }

    /// Device status report.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures and inconsistent image records.
    pub async fn status(&self) -> Result<DeviceStatus> {
        let c = &self.collaborators;
        let services = c.services.all().await?;
        let images = c.images.all_statuses().await?;

        let mut commits = BTreeMap::new();
        for app_id in services.iter().map(|s| s.app_id).unique() {
            if let Some(commit) = c.commits.current_commit(app_id).await? {
                commits.insert(app_id, commit);
            }
        }

        device_status(&services, &images, &commits)
    }

    /// The event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// The step executor.
    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }
}

/// Builder for [`ApplicationManager`].
pub struct ApplicationManagerBuilder {
    services: Option<Arc<dyn ServiceManager>>,
    images: Option<Arc<dyn ImageManager>>,
    networks: Option<Arc<dyn NetworkManager>>,
    volumes: Option<Arc<dyn VolumeManager>>,
    dependent: Option<Arc<dyn DependentDevices>>,
    commits: Option<Arc<dyn CommitStore>>,
    targets: Option<Arc<dyn TargetStore>>,
    lock: Option<Arc<dyn UpdateLock>>,
    bus: Option<Arc<EventBus>>,
    config: ReconcilerConfig,
    capabilities: DeviceCapabilities,
}

impl ApplicationManagerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            services: None,
            images: None,
            networks: None,
            volumes: None,
            dependent: None,
            commits: None,
            targets: None,
            lock: None,
            bus: None,
            config: ReconcilerConfig::default(),
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Use one engine for services, images, networks and volumes.
    pub fn with_engine<E>(mut self, engine: Arc<E>) -> Self
    where
        E: ServiceManager + ImageManager + NetworkManager + VolumeManager + 'static,
    {
        self.services = Some(engine.clone());
        self.images = Some(engine.clone());
        self.networks = Some(engine.clone());
        self.volumes = Some(engine);
        self
    }

    /// Set the service manager.
    pub fn with_services(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = Some(services);
        self
    }

    /// Set the image manager.
    pub fn with_images(mut self, images: Arc<dyn ImageManager>) -> Self {
        self.images = Some(images);
        self
    }

    /// Set the network manager.
    pub fn with_networks(mut self, networks: Arc<dyn NetworkManager>) -> Self {
        self.networks = Some(networks);
        self
    }

    /// Set the volume manager.
    pub fn with_volumes(mut self, volumes: Arc<dyn VolumeManager>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    /// Set the dependent-device subsystem.
    pub fn with_dependent(mut self, dependent: Arc<dyn DependentDevices>) -> Self {
        self.dependent = Some(dependent);
        self
    }

    /// Set the commit store.
    pub fn with_commits(mut self, commits: Arc<dyn CommitStore>) -> Self {
        self.commits = Some(commits);
        self
    }

    /// Set the target store.
    pub fn with_targets(mut self, targets: Arc<dyn TargetStore>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Set the update lock.
    pub fn with_lock(mut self, lock: Arc<dyn UpdateLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set the event bus.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the device capabilities contracts are checked against.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` when an engine collaborator is missing
    /// or the configuration is invalid.
    pub fn build(self) -> Result<ApplicationManager> {
        self.config.validate()?;

        let collaborators = Collaborators {
            services: self
                .services
                .ok_or_else(|| Error::invalid_config("Service manager is required"))?,
            images: self
                .images
                .ok_or_else(|| Error::invalid_config("Image manager is required"))?,
            networks: self
                .networks
                .ok_or_else(|| Error::invalid_config("Network manager is required"))?,
            volumes: self
                .volumes
                .ok_or_else(|| Error::invalid_config("Volume manager is required"))?,
            dependent: self
                .dependent
                .unwrap_or_else(|| Arc::new(NoDependentDevices)),
            commits: self
                .commits
                .unwrap_or_else(|| Arc::new(InMemoryCommitStore::new())),
        };
        let targets = self
            .targets
            .unwrap_or_else(|| Arc::new(InMemoryTargetStore::default()));
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(InMemoryUpdateLock::new()));
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));

        let executor = Arc::new(StepExecutor::new(
            collaborators.clone(),
            lock,
            bus.clone(),
            self.config.clone(),
        ));

        Ok(ApplicationManager {
            collaborators,
            targets,
            executor,
            bus,
            config: self.config,
            capabilities: self.capabilities,
            volatile: RwLock::new(BTreeMap::new()),
        })
    }
}

impl Default for ApplicationManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ContractRequirement, ServiceContract};
    use crate::lock::LockOptions;
    use crate::memory::InMemoryEngine;
    use crate::model::{labels, ComposeService, ReleaseId, ServiceStatus};

    fn compose_service(id: u32, name: &str, image: &str) -> ComposeService {
        ComposeService {
            service_id: ServiceId(id),
            service_name: name.to_string(),
            image: image.to_string(),
            image_id: ImageId(id),
            ..ComposeService::default()
        }
    }

    fn compose_app(services: Vec<ComposeService>) -> ComposeApp {
        ComposeApp {
            name: Some("demo".to_string()),
            commit: Some("abc".to_string()),
            release_id: Some(ReleaseId(1)),
            services,
            ..ComposeApp::default()
        }
    }

    fn manager(engine: Arc<InMemoryEngine>) -> Option<ApplicationManager> {
        ApplicationManager::builder()
            .with_engine(engine)
            .with_capabilities(DeviceCapabilities::new().with("sw.supervisor", "10.0.0"))
            .build()
            .ok()
    }

    fn gpu_service(id: u32, name: &str, optional: bool) -> ComposeService {
        let mut service = compose_service(id, name, "gpu-img");
        service.contract = Some(ServiceContract {
            requires: vec![ContractRequirement {
                kind: "hw.gpu".to_string(),
                version: None,
            }],
        });
        if optional {
            service
                .labels
                .insert(labels::OPTIONAL.to_string(), "1".to_string());
        }
        service
    }

    /// Given a running service
    /// When every service is stopped with keep_locks
    /// Then the app stays locked until its kept lock is released
    #[tokio::test]
    async fn stop_all_can_keep_locks() {
        let engine = Arc::new(InMemoryEngine::ready());
        engine
            .add_services([crate::model::Service {
                app_id: AppId(1),
                service_id: ServiceId(1),
                service_name: "main".to_string(),
                release_id: ReleaseId(1),
                image_id: ImageId(1),
                image_name: "img".to_string(),
                container_id: Some("c1".to_string()),
                status: ServiceStatus::Running,
                created_at: None,
                config: ServiceConfig::default(),
            }])
            .await;
        let lock = Arc::new(InMemoryUpdateLock::new());
        let Ok(manager) = ApplicationManager::builder()
            .with_engine(engine)
            .with_lock(lock.clone())
            .build()
        else {
            return;
        };
        let short_wait = LockOptions {
            timeout: Some(std::time::Duration::from_millis(20)),
            ..LockOptions::default()
        };

        let stopped = manager
            .stop_all(ExecuteOptions {
                keep_locks: true,
                ..ExecuteOptions::default()
            })
            .await;

        assert!(stopped.is_ok());
        assert!(matches!(
            lock.acquire(AppId(1), short_wait).await,
            Err(Error::LockTimeout { app_id: 1 })
        ));

        manager.release_kept_locks([AppId(1)]).await;
        assert!(lock.acquire(AppId(1), short_wait).await.is_ok());
    }

    #[test]
    fn builder_requires_engine() {
        let result = ApplicationManager::builder().build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    /// Given an empty device and an empty target
    /// When a pass runs
    /// Then it only ensures the supervisor network, and the next pass converges
    #[tokio::test]
    async fn empty_device_converges_after_supervisor_network() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::new())) else {
            return;
        };

        let first = manager.apply_target(ExecuteOptions::default()).await;
        assert!(first.is_ok_and(|r| r.taken.len() == 1 && !r.converged));

        let second = manager.apply_target(ExecuteOptions::default()).await;
        assert!(second.is_ok_and(|r| r.converged));
    }

    /// Given a one-service target on an empty device
    /// When passes run until nothing is left
    /// Then the service runs and the commit is recorded
    #[tokio::test]
    async fn single_service_app_converges() {
        let engine = Arc::new(InMemoryEngine::ready());
        let Some(manager) = manager(engine.clone()) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(target).await.is_ok());

        let mut converged = false;
        for _ in 0..10 {
            let result = manager.apply_target(ExecuteOptions::default()).await;
            assert!(result.as_ref().is_ok_and(|r| r.failed.is_empty()), "{result:?}");
            if result.is_ok_and(|r| r.converged) {
                converged = true;
                break;
            }
        }

        assert!(converged);
        let current = manager.current_state().await.unwrap_or_default();
        let app = current.app(AppId(1));
        assert_eq!(app.and_then(|a| a.commit.clone()), Some("abc".to_string()));
        assert!(app.is_some_and(|a| a
            .services
            .iter()
            .all(|s| s.status == ServiceStatus::Running)));
    }

    #[tokio::test]
    async fn invalid_app_key_stores_nothing() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let target = BTreeMap::from([("one".to_string(), compose_app(vec![]))]);

        let result = manager.set_target(target).await;

        assert!(matches!(result, Err(Error::InvalidAppId { .. })));
        assert!(manager.target_state().await.is_ok_and(|s| s.apps.is_empty()));
    }

    /// Given an app with a required service whose contract is unmet
    /// When the target is written
    /// Then the app keeps its previous target and the violation is reported
    #[tokio::test]
    async fn contract_violation_keeps_previous_target() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let old = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(old).await.is_ok());

        let new = BTreeMap::from([
            ("1".to_string(), compose_app(vec![gpu_service(2, "ml", false)])),
            ("2".to_string(), compose_app(vec![compose_service(3, "web", "web")])),
        ]);
        let result = manager.set_target(new).await;

        assert!(matches!(result, Err(Error::ContractViolation { ref violators }) if violators.contains_key("demo")));
        let target = manager.target_state().await.unwrap_or_default();
        assert_eq!(
            target.app(AppId(1)).map(|a| a.services.iter().map(|s| s.service_name.clone()).collect::<Vec<_>>()),
            Some(vec!["main".to_string()])
        );
        assert!(target.app(AppId(2)).is_some());
    }

    #[tokio::test]
    async fn optional_unmet_services_are_dropped_and_reported() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let mut events = manager.bus().subscribe();
        let target = BTreeMap::from([(
            "1".to_string(),
            compose_app(vec![compose_service(1, "main", "img"), gpu_service(2, "ml", true)]),
        )]);

        assert!(manager.set_target(target).await.is_ok());

        let stored = manager.target_state().await.unwrap_or_default();
        assert_eq!(stored.app(AppId(1)).map(|a| a.services.len()), Some(1));
        assert!(matches!(
            events.recv().await,
            Ok(StateEvent::OptionalServicesSkipped { ref services, .. }) if services == &vec!["ml".to_string()]
        ));
        assert!(matches!(events.recv().await, Ok(StateEvent::TargetUpdated { .. })));
    }

    #[tokio::test]
    async fn volatile_override_applies_until_next_target() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(target.clone()).await.is_ok());

        manager
            .set_target_volatile_for_service(ImageId(1), VolatileOverride { running: Some(false) })
            .await;
        let running = |s: &StateSnapshot| s.services().all(|svc| svc.config.running);
        assert!(manager.target_state().await.is_ok_and(|s| !running(&s)));

        assert!(manager.set_target(target).await.is_ok());
        assert!(manager.target_state().await.is_ok_and(|s| running(&s)));
    }

    #[tokio::test]
    async fn service_name_lookup() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(7, "main", "img")]))]);
        assert!(manager.set_target(target).await.is_ok());

        assert_eq!(
            manager.service_name_from_id(ServiceId(7)).await.ok().flatten(),
            Some("main".to_string())
        );
        assert_eq!(manager.service_name_from_id(ServiceId(8)).await.ok().flatten(), None);
    }

    /// Given an image-changing target
    /// When steps are inferred while ignoring images
    /// Then inference fails instead of downloading
    #[tokio::test]
    async fn fetch_while_ignoring_images_fails() {
        let Some(manager) = manager(Arc::new(InMemoryEngine::ready())) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(target).await.is_ok());

        let current = manager.current_state().await.unwrap_or_default();
        let target = manager.target_state().await.unwrap_or_default();
        let result = manager.required_steps(&current, &target, true).await;

        assert!(matches!(result, Err(Error::FetchWhileIgnoringImages)));
    }

    #[tokio::test]
    async fn stop_all_kills_everything() {
        let engine = Arc::new(InMemoryEngine::ready());
        let Some(manager) = manager(engine.clone()) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(target).await.is_ok());
        for _ in 0..5 {
            let _ = manager.apply_target(ExecuteOptions::default()).await;
        }

        assert!(manager.stop_all(ExecuteOptions::default()).await.is_ok());
        assert!(ServiceManager::all(engine.as_ref()).await.is_ok_and(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn status_reports_running_service() {
        let engine = Arc::new(InMemoryEngine::ready());
        let Some(manager) = manager(engine.clone()) else {
            return;
        };
        let target = BTreeMap::from([("1".to_string(), compose_app(vec![compose_service(1, "main", "img")]))]);
        assert!(manager.set_target(target).await.is_ok());
        for _ in 0..5 {
            let _ = manager.apply_target(ExecuteOptions::default()).await;
        }

        let status = manager.status().await.unwrap_or_default();
        let report = status.local.get(&AppId(1)).and_then(|a| a.services.get(&ImageId(1)));
        assert_eq!(report.map(|r| r.status.as_str()), Some("Running"));
    }
}
