//! Device-wide step inference.
//!
//! [`infer_next_steps`] is pure: it looks at a current/target snapshot pair
//! plus a handful of facts gathered by the caller and returns the steps the
//! device should take next. Gates are applied in order:
//!
//! 1. supervisor network readiness,
//! 2. image bookkeeping (cleanup, save, remove),
//! 3. per-app sequencing, with volume teardown for vanished apps.
//!
//! Fetches are then throttled when delta downloads are enabled.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, info};

use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::images::{analyze_images, best_delta_source, ImageContext};
use crate::model::{AppId, ContainerIds, Image, ImageId, StartedContainers, StateSnapshot};
use crate::sequencer::{next_steps_for_app, AppContext};
use crate::step::{dedup, Step, StepKind};

/// Facts about the device beyond the two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraState {
    pub cleanup_needed: bool,
    /// Images present locally.
    pub available: Vec<Image>,
    /// Image ids currently downloading.
    pub downloading: Vec<ImageId>,
    pub supervisor_network_ready: bool,
    /// Service name to container id, per app.
    pub container_ids: BTreeMap<AppId, ContainerIds>,
    /// Image names in use by dependent devices.
    pub dependent_images: Vec<String>,
}

/// Everything a pass reads.
#[derive(Debug, Clone, Copy)]
pub struct InferenceInput<'a> {
    pub current: &'a StateSnapshot,
    pub target: &'a StateSnapshot,
    pub extra: &'a ExtraState,
    /// Never introduce image work; used when validating a single API action.
    pub ignore_images: bool,
    pub config: &'a ReconcilerConfig,
    pub started: &'a StartedContainers,
}

fn check_keys(snapshot: &StateSnapshot, side: &str) -> Result<()> {
    match snapshot.apps.iter().find(|(key, app)| **key != app.app_id) {
        Some((key, app)) => Err(Error::internal_inconsistency(format!(
            "{side} app keyed {key} carries app id {}",
            app.app_id
        ))),
        None => Ok(()),
    }
}

/// Kill whatever needs the supervisor network, or create it once nothing does.
fn supervisor_network_steps(current: &StateSnapshot) -> Vec<Step> {
    let steps: Vec<Step> = current
        .services()
        .filter(|s| s.needs_supervisor_api())
        .map(|s| {
            if s.status == crate::model::ServiceStatus::Stopping {
                Step::noop()
            } else {
                Step::kill(s).with_app(s.app_id)
            }
        })
        .collect();

    if steps.is_empty() {
        vec![StepKind::EnsureSupervisorNetwork.into()]
    } else {
        steps
    }
}

/// Drop fetches beyond the delta download limit.
///
/// Only fetches that have a delta base are throttled; among those the highest
/// `(app id, service id)` keys go first so the outcome is deterministic.
fn throttle_fetches(steps: Vec<Step>, input: &InferenceInput<'_>) -> Vec<Step> {
    let new_downloads = steps.iter().filter(|s| matches!(s.kind, StepKind::Fetch { .. })).count();
    let excess = input
        .extra
        .downloading
        .len()
        .saturating_add(new_downloads)
        .saturating_sub(input.config.max_delta_downloads);
    if excess == 0 {
        return steps;
    }

    let mut throttleable: Vec<((AppId, u32), usize)> = steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| match &step.kind {
            StepKind::Fetch { image, service_id, .. }
                if best_delta_source(image, &input.extra.available).is_some() =>
            {
                Some(((image.app_id, service_id.value()), index))
            }
            _ => None,
        })
        .collect();
    throttleable.sort_by(|a, b| b.0.cmp(&a.0));

    let dropped: HashSet<usize> = throttleable
        .into_iter()
        .take(excess)
        .map(|(_, index)| index)
        .collect();
    if !dropped.is_empty() {
        info!(
            dropped = dropped.len(),
            limit = input.config.max_delta_downloads,
            "Throttling delta downloads"
        );
    }

    steps
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !dropped.contains(index))
        .map(|(_, step)| step)
        .collect()
}

/// Infer the next steps for the whole device.
///
/// # Errors
///
/// Returns `Error::InternalInconsistency` when a snapshot key disagrees with
/// the app id it holds.
pub fn infer_next_steps(input: &InferenceInput<'_>) -> Result<Vec<Step>> {
    check_keys(input.current, "current")?;
    check_keys(input.target, "target")?;

    let config = input.config;
    let extra = input.extra;
    let ignore_images = input.ignore_images || config.local_mode;
    let cleanup_needed = extra.cleanup_needed && !config.local_mode;

    let mut steps: Vec<Step> = Vec::new();
    let mut volume_steps: Vec<Step> = Vec::new();

    if !extra.supervisor_network_ready {
        steps = supervisor_network_steps(input.current);
    } else {
        if !ignore_images && extra.downloading.is_empty() {
            if cleanup_needed {
                steps.push(StepKind::Cleanup.into());
            }
            let analysis = analyze_images(&ImageContext {
                current: input.current,
                target: input.target,
                available: &extra.available,
                local_mode: config.local_mode,
                dependent_images: &extra.dependent_images,
            });
            let saving = !analysis.to_save.is_empty();
            steps.extend(
                analysis
                    .to_save
                    .into_iter()
                    .map(|image| Step::from(StepKind::SaveImage { image })),
            );
            if !saving {
                steps.extend(
                    analysis
                        .to_remove
                        .into_iter()
                        .map(|image| Step::from(StepKind::RemoveImage { image })),
                );
            }
        }

        if steps.is_empty() {
            let no_ids = ContainerIds::new();
            let app_ids: BTreeSet<AppId> = input
                .current
                .apps
                .keys()
                .chain(input.target.apps.keys())
                .copied()
                .collect();

            for app_id in app_ids {
                let current = input.current.app(app_id);
                let target = input.target.app(app_id);
                let ctx = AppContext {
                    local_mode: config.local_mode,
                    container_ids: extra.container_ids.get(&app_id).unwrap_or(&no_ids),
                    available: &extra.available,
                    downloading: &extra.downloading,
                    started: input.started,
                };
                let app_steps = next_steps_for_app(app_id, current, target, &ctx);

                if let (Some(vanished), None, false) = (current, target, config.local_mode) {
                    if app_steps.iter().all(Step::is_noop) {
                        debug!(app_id = %app_id, "App torn down, removing its volumes");
                        volume_steps.extend(vanished.volumes.values().map(|volume| {
                            Step::from(StepKind::RemoveVolume {
                                current: volume.clone(),
                            })
                            .with_app(app_id)
                        }));
                    }
                }
                steps.extend(app_steps);
            }
        }
    }

    if !ignore_images && config.delta {
        steps = throttle_fetches(steps, input);
    }

    if !ignore_images && steps.is_empty() && !extra.downloading.is_empty() {
        steps.push(Step::noop());
    }

    let mut steps = dedup(steps);
    steps.extend(volume_steps);
    Ok(steps)
}
