//! Steps for network and volume pairs.

use tracing::debug;

use crate::compare::{EntityPair, ServicePair};
use crate::model::{App, Network, Service, ServiceStatus, Volume};
use crate::step::{Step, StepKind};

/// Kill every dependent that is not already going away.
fn kill_dependents(dependents: &[&Service], changing: &[ServicePair<'_>]) -> Vec<Step> {
    dependents
        .iter()
        .filter(|service| service.status != ServiceStatus::Stopping)
        .filter(|service| !changing.iter().any(|pair| pair.service_id == service.service_id))
        .map(|service| Step::kill(service))
        .collect()
}

/// Steps for one network pair.
///
/// A network that is removed or reconfigured can only go once no current
/// service runs on it; until then its dependents are killed.
pub fn next_steps_for_network(
    pair: &EntityPair<'_, Network>,
    current_app: &App,
    changing: &[ServicePair<'_>],
) -> Vec<Step> {
    match (pair.current, pair.target) {
        (Some(current), _) => {
            let dependents: Vec<&Service> = current_app
                .services
                .iter()
                .filter(|s| s.uses_network(&current.name))
                .collect();
            if dependents.is_empty() {
                vec![StepKind::RemoveNetwork {
                    current: current.clone(),
                }
                .into()]
            } else {
                debug!(
                    network = %current.name,
                    dependents = dependents.len(),
                    "Network still in use"
                );
                kill_dependents(&dependents, changing)
            }
        }
        (None, Some(target)) => vec![StepKind::CreateNetwork {
            target: target.clone(),
        }
        .into()],
        (None, None) => Vec::new(),
    }
}

/// Steps for one volume pair.
///
/// Volumes are never removed here: removal only happens when the whole app
/// is torn down.
pub fn next_steps_for_volume(
    pair: &EntityPair<'_, Volume>,
    current_app: &App,
    changing: &[ServicePair<'_>],
) -> Vec<Step> {
    match (pair.current, pair.target) {
        (Some(current), _) => {
            let dependents: Vec<&Service> = current_app
                .services
                .iter()
                .filter(|s| s.uses_volume(&current.name))
                .collect();
            kill_dependents(&dependents, changing)
        }
        (None, Some(target)) => vec![StepKind::CreateVolume {
            target: target.clone(),
        }
        .into()],
        (None, None) => Vec::new(),
    }
}
