//! Per-application update locks.
//!
//! Service-disrupting steps run while holding the app's lock. A user can
//! hold the lock from outside (e.g. while a critical section of their app
//! must not be interrupted); the reconciler then refuses to act unless the
//! acquisition is forced.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::AppId;

/// How to take a lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Ignore user holds.
    pub force: bool,
    /// Do not lock at all.
    pub skip: bool,
    /// Keep the lock after the guard is dropped, until released explicitly.
    pub keep: bool,
    /// Give up waiting after this long.
    pub timeout: Option<Duration>,
}

impl LockOptions {
    /// Options with `force` set.
    pub fn forced(force: bool) -> Self {
        Self {
            force,
            ..Self::default()
        }
    }
}

/// Scoped lock guard; the lock is released when it is dropped.
#[derive(Debug)]
pub struct LockGuard {
    app_id: AppId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockGuard {
    /// A guard that holds nothing.
    pub fn unlocked(app_id: AppId) -> Self {
        Self {
            app_id,
            guard: None,
        }
    }

    /// The app the guard belongs to.
    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Whether this guard actually holds the lock.
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

/// Capability to lock an app against updates.
#[async_trait]
pub trait UpdateLock: Send + Sync {
    /// Acquire the lock of `app_id`.
    async fn acquire(&self, app_id: AppId, options: LockOptions) -> Result<LockGuard>;

    /// Release a lock taken with [`LockOptions::keep`]. No-op when none is kept.
    async fn release_kept(&self, app_id: AppId);
}

/// Run `fut` while holding the lock of `app_id`.
///
/// # Errors
///
/// Returns the acquisition error, or whatever `fut` returns.
pub async fn with_lock<L, F, T>(lock: &L, app_id: AppId, options: LockOptions, fut: F) -> Result<T>
where
    L: UpdateLock + ?Sized,
    F: Future<Output = Result<T>>,
{
    let _guard = lock.acquire(app_id, options).await?;
    fut.await
}

/// In-process lock registry.
#[derive(Debug, Default)]
pub struct InMemoryUpdateLock {
    locks: Mutex<HashMap<AppId, Arc<Mutex<()>>>>,
    holds: Mutex<HashSet<AppId>>,
    kept: Mutex<HashMap<AppId, OwnedMutexGuard<()>>>,
}

impl InMemoryUpdateLock {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the lock on behalf of the user.
    pub async fn hold(&self, app_id: AppId) {
        self.holds.lock().await.insert(app_id);
    }

    /// Drop a user hold.
    pub async fn release_hold(&self, app_id: AppId) {
        self.holds.lock().await.remove(&app_id);
    }

    /// Whether a user hold is in place.
    pub async fn is_held(&self, app_id: AppId) -> bool {
        self.holds.lock().await.contains(&app_id)
    }

    async fn app_mutex(&self, app_id: AppId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(app_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock_app(&self, app_id: AppId, timeout: Option<Duration>) -> Result<OwnedMutexGuard<()>> {
        let mutex = self.app_mutex(app_id).await;
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, mutex.lock_owned())
                .await
                .map_err(|_| Error::LockTimeout {
                    app_id: app_id.value(),
                }),
            None => Ok(mutex.lock_owned().await),
        }
    }
}

#[async_trait]
impl UpdateLock for InMemoryUpdateLock {
    async fn acquire(&self, app_id: AppId, options: LockOptions) -> Result<LockGuard> {
        if options.skip {
            return Ok(LockGuard::unlocked(app_id));
        }
        if !options.force && self.is_held(app_id).await {
            return Err(Error::UpdatesLocked {
                app_id: app_id.value(),
            });
        }
        if options.keep {
            // Held across the wait so concurrent keep-mode steps of one app
            // share a single kept guard.
            let mut kept = self.kept.lock().await;
            if !kept.contains_key(&app_id) {
                let guard = self.lock_app(app_id, options.timeout).await?;
                kept.insert(app_id, guard);
                debug!(app_id = %app_id, "Keeping lock");
            }
            return Ok(LockGuard::unlocked(app_id));
        }

        let guard = self.lock_app(app_id, options.timeout).await?;
        Ok(LockGuard {
            app_id,
            guard: Some(guard),
        })
    }

    async fn release_kept(&self, app_id: AppId) {
        if self.kept.lock().await.remove(&app_id).is_some() {
            debug!(app_id = %app_id, "Released kept lock");
        }
    }
}
