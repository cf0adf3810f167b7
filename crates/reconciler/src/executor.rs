//! Step execution.
//!
//! [`StepExecutor`] routes each step to the collaborator that owns it.
//! Steps that disrupt a running service take the app's update lock first.
//! Every outcome except a `noop` is published on the event bus, and fetches
//! report their progress there.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stevedore_events::{EventBus, StateEvent};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::collaborators::{
    CommitStore, DependentDevices, ImageManager, NetworkManager, ServiceManager, VolumeManager,
};
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::images::best_delta_source;
use crate::lock::{LockOptions, UpdateLock};
use crate::model::{AppId, ImageId, StartedContainers};
use crate::step::{Action, Step, StepKind};

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Take update locks even when the user holds them.
    pub force: bool,
    /// Do not take update locks.
    pub skip_lock: bool,
    /// Keep every lock taken until it is released through
    /// [`UpdateLock::release_kept`], so a sequence of steps runs under one hold.
    pub keep_locks: bool,
}

/// Download bookkeeping.
#[derive(Debug, Default)]
pub struct FetchStats {
    in_progress: AtomicUsize,
    time_spent_ms: AtomicU64,
}

impl FetchStats {
    /// Fetches currently running.
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Total time spent fetching.
    pub fn time_spent(&self) -> Duration {
        Duration::from_millis(self.time_spent_ms.load(Ordering::SeqCst))
    }

    fn begin(&self) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self, elapsed: Duration) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.time_spent_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

/// The collaborators a [`StepExecutor`] drives.
#[derive(Clone)]
pub struct Collaborators {
    pub services: Arc<dyn ServiceManager>,
    pub images: Arc<dyn ImageManager>,
    pub networks: Arc<dyn NetworkManager>,
    pub volumes: Arc<dyn VolumeManager>,
    pub dependent: Arc<dyn DependentDevices>,
    pub commits: Arc<dyn CommitStore>,
}

/// Executes steps against the collaborators.
pub struct StepExecutor {
    collaborators: Collaborators,
    lock: Arc<dyn UpdateLock>,
    bus: Arc<EventBus>,
    config: ReconcilerConfig,
    started: RwLock<StartedContainers>,
    fetches: FetchStats,
}

impl StepExecutor {
    /// Create an executor.
    pub fn new(
        collaborators: Collaborators,
        lock: Arc<dyn UpdateLock>,
        bus: Arc<EventBus>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            collaborators,
            lock,
            bus,
            config,
            started: RwLock::new(StartedContainers::new()),
            fetches: FetchStats::default(),
        }
    }

    /// Snapshot of the containers started so far.
    pub async fn started(&self) -> StartedContainers {
        self.started.read().await.clone()
    }

    /// Download bookkeeping.
    pub fn fetch_stats(&self) -> &FetchStats {
        &self.fetches
    }

    /// The update lock in use.
    pub fn lock(&self) -> &Arc<dyn UpdateLock> {
        &self.lock
    }

    /// Check an action name coming from outside.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAction` when neither this executor nor the
    /// dependent-device subsystem knows the name.
    pub async fn validate_action(&self, name: &str) -> Result<()> {
        if Action::parse(name).is_ok() {
            return Ok(());
        }
        let dependent = self.collaborators.dependent.valid_actions().await?;
        if dependent.iter().any(|action| action == name) {
            Ok(())
        } else {
            Err(Error::invalid_action(name))
        }
    }

    /// Execute one step and publish the outcome.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAction` for an unknown dependent action, lock
    /// errors for disrupting steps, and whatever the collaborator returns.
    pub async fn execute(&self, step: &Step, options: ExecuteOptions) -> Result<()> {
        if let StepKind::Dependent { name, .. } = &step.kind {
            self.validate_action(name).await?;
        }

        let app_id = step.app_id.map(AppId::value);
        debug!(action = step.action_name(), app_id, "Executing step");

        match self.apply(step, options).await {
            Ok(()) if matches!(step.kind, StepKind::Noop) => Ok(()),
            Ok(()) => {
                self.bus
                    .publish(StateEvent::step_completed(app_id, step.action_name()))
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(action = step.action_name(), app_id, error = %e, "Step failed");
                self.bus
                    .publish(StateEvent::step_failed(
                        app_id,
                        step.action_name(),
                        e.to_string(),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    fn lock_options(&self, options: ExecuteOptions) -> LockOptions {
        LockOptions {
            force: options.force || self.config.lock_override,
            skip: options.skip_lock,
            keep: options.keep_locks,
            ..LockOptions::default()
        }
    }

    async fn apply(&self, step: &Step, options: ExecuteOptions) -> Result<()> {
        let c = &self.collaborators;
        let lock_options = self.lock_options(options);

        match &step.kind {
            StepKind::Kill { current, .. } => {
                let _guard = self.lock.acquire(current.app_id, lock_options).await?;
                c.services.kill(current).await?;
                self.forget_started(current.container_id.as_deref()).await;
            }
            StepKind::Stop { current, .. } => {
                let _guard = self.lock.acquire(current.app_id, lock_options).await?;
                c.services.stop(current).await?;
                self.forget_started(current.container_id.as_deref()).await;
            }
            StepKind::Remove { current, .. } => {
                let _guard = self.lock.acquire(current.app_id, lock_options).await?;
                c.services.remove(current).await?;
            }
            StepKind::Handover {
                current,
                target,
                timeout,
                ..
            } => {
                let _guard = self.lock.acquire(current.app_id, lock_options).await?;
                c.services.handover(current, target, *timeout).await?;
            }
            StepKind::UpdateMetadata {
                current, target, ..
            } => {
                let _guard = self.lock.acquire(current.app_id, lock_options).await?;
                c.services.update_metadata(current, target).await?;
            }
            StepKind::Start {
                current, target, ..
            } => {
                let container = current.as_ref().unwrap_or(target);
                let container_id = c.services.start(container).await?;
                self.started.write().await.record(container_id);
            }
            StepKind::Fetch { image, .. } => {
                let delta_source = if self.config.delta {
                    let available = c.images.available().await?;
                    best_delta_source(image, &available).map(str::to_string)
                } else {
                    None
                };
                info!(image = %image.name, delta_source = delta_source.as_deref(), "Fetching image");

                let image_id = image.image_id.map(ImageId::value);
                if let Some(id) = image_id {
                    self.bus.publish(StateEvent::download_progress(id, 0)).await;
                }

                self.fetches.begin();
                let started = Instant::now();
                let result = c.images.fetch(image, delta_source.as_deref()).await;
                self.fetches.end(started.elapsed());
                result?;

                if let Some(id) = image_id {
                    self.bus.publish(StateEvent::download_progress(id, 100)).await;
                }
            }
            StepKind::CreateNetwork { target } => c.networks.create(target).await?,
            StepKind::RemoveNetwork { current } => c.networks.remove(current).await?,
            StepKind::CreateVolume { target } => c.volumes.create(target).await?,
            StepKind::RemoveVolume { current } => c.volumes.remove(current).await?,
            StepKind::SaveImage { image } => c.images.save(image).await?,
            StepKind::RemoveImage { image } => c.images.remove(image).await?,
            StepKind::Cleanup => {
                if self.config.local_mode {
                    debug!("Local mode, skipping image cleanup");
                } else {
                    c.images.cleanup().await?;
                }
            }
            StepKind::EnsureSupervisorNetwork => c.networks.ensure_supervisor_network().await?,
            StepKind::UpdateCommit { target } => {
                let app_id = step.app_id.ok_or_else(|| {
                    Error::internal_inconsistency("updateCommit step without an app id")
                })?;
                c.commits.set_current_commit(app_id, target).await?;
            }
            StepKind::Noop => {}
            StepKind::Dependent { .. } => c.dependent.execute(step).await?,
        }
        Ok(())
    }

    async fn forget_started(&self, container_id: Option<&str>) {
        if let Some(id) = container_id {
            self.started.write().await.clear(id);
        }
    }
}
