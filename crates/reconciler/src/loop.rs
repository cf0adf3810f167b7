//! Continuous reconciliation loop.

use std::sync::Arc;
use std::time::Duration;

use stevedore_events::{Error as EventError, EventPattern, EventSubscription, StateEvent};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::executor::ExecuteOptions;
use crate::manager::ApplicationManager;
use crate::step::Action;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between reconciliation passes.
    pub interval: Duration,
    /// Maximum consecutive failed passes before stopping.
    pub max_errors: usize,
    /// Whether to stop on first error.
    pub stop_on_error: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_errors: 10,
            stop_on_error: false,
        }
    }
}

/// What a successful pass achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    /// Nothing was left to do.
    Converged,
    /// Steps changed the device, so the next pass can start right away.
    Progressed,
    /// Only noops: the device waits on a download or a dependency.
    Waiting,
}

/// Continuous reconciliation loop.
///
/// Runs a pass on every tick, and whenever a state-changing event arrives
/// on the manager's bus. Passes that made progress are followed at once by
/// another; a pass that only waited or failed is retried on the next tick.
/// Every pass recomputes its steps from fresh state, and the events a pass
/// published never wake the loop themselves.
pub struct ReconciliationLoop {
    manager: Arc<ApplicationManager>,
    config: LoopConfig,
    events: EventSubscription,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    /// Create a new reconciliation loop.
    pub fn new(manager: Arc<ApplicationManager>, config: LoopConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let events = manager.bus().subscribe_with_pattern(EventPattern::StateChanges);
        Self {
            manager,
            config,
            events,
            stop_rx,
            stop_tx,
        }
    }

    /// Run the reconciliation loop.
    ///
    /// This runs until stopped or max errors reached.
    ///
    /// # Errors
    ///
    /// Returns the failure of the first pass when `stop_on_error` is set,
    /// `Error::ReconcileFailed` after `max_errors` consecutive failures, and
    /// `Error::LoopStopped` if the event bus goes away.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis(),
            "Starting reconciliation loop"
        );

        let mut consecutive_errors = 0usize;
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                event = self.events.recv() => {
                    match event {
                        Ok(event) => debug!(event = event.event_type(), "State changed"),
                        Err(EventError::Lagged { skipped }) => {
                            warn!(skipped, "Missed state events");
                        }
                        Err(EventError::ChannelClosed) => {
                            error!("Event bus closed");
                            return Err(Error::LoopStopped);
                        }
                    }
                }
                _ = self.stop_rx.changed() => {
                    if self.is_stopped() {
                        info!("Reconciliation loop stopped");
                        return Ok(());
                    }
                    continue;
                }
            }

            loop {
                let outcome = self.pass(&mut consecutive_errors).await?;
                let target_changed = self.drain_own_events();
                if self.is_stopped() {
                    info!("Reconciliation loop stopped");
                    return Ok(());
                }
                if outcome != Some(PassOutcome::Progressed) && !target_changed {
                    break;
                }
            }
            interval.reset();
        }
    }

    /// Run a pass; `Ok(None)` when it failed but the loop goes on.
    async fn pass(&self, consecutive_errors: &mut usize) -> Result<Option<PassOutcome>> {
        match self.reconcile_once().await {
            Ok(outcome) => {
                *consecutive_errors = 0;
                if outcome == PassOutcome::Converged {
                    debug!("Device converged");
                }
                Ok(Some(outcome))
            }
            Err(e) => {
                *consecutive_errors = consecutive_errors.saturating_add(1);
                error!(
                    error = %e,
                    consecutive = *consecutive_errors,
                    "Reconciliation error"
                );

                if self.config.stop_on_error {
                    return Err(e);
                }

                if *consecutive_errors >= self.config.max_errors {
                    error!("Max errors reached, stopping loop");
                    return Err(Error::reconcile_failed(format!(
                        "Max errors ({}) reached",
                        self.config.max_errors
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Run a single pass.
    async fn reconcile_once(&self) -> Result<PassOutcome> {
        let result = self.manager.apply_target(ExecuteOptions::default()).await?;

        if let Some((step, reason)) = result.failed.first() {
            return Err(Error::reconcile_failed(format!(
                "{} of {} steps failed, first {}: {reason}",
                result.failed.len(),
                result.failed.len().saturating_add(result.taken.len()),
                step.action_name()
            )));
        }

        if result.converged {
            Ok(PassOutcome::Converged)
        } else if result.taken.iter().all(|step| step.action() == Action::Noop) {
            Ok(PassOutcome::Waiting)
        } else {
            Ok(PassOutcome::Progressed)
        }
    }

    /// Discard the events queued while a pass ran, reporting whether a new
    /// target arrived among them.
    fn drain_own_events(&mut self) -> bool {
        let mut target_changed = false;
        loop {
            match self.events.try_recv() {
                Ok(Some(StateEvent::TargetUpdated { .. })) => target_changed = true,
                Ok(Some(_)) => {}
                Ok(None) | Err(EventError::ChannelClosed) => return target_changed,
                Err(EventError::Lagged { skipped }) => {
                    warn!(skipped, "Missed state events");
                    target_changed = true;
                }
            }
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
