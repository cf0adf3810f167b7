//! Pairwise comparison of current and target entities.

use std::collections::BTreeMap;

use either::Either;
use itertools::Itertools;

use crate::model::{ContainerIds, Network, Service, ServiceId, StartedContainers, Volume};

/// A current/target service pair; at most one side is absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServicePair<'a> {
    pub current: Option<&'a Service>,
    pub target: Option<&'a Service>,
    pub service_id: ServiceId,
}

/// Service pairs split by what has to happen to them.
#[derive(Debug, Clone, Default)]
pub struct ServicePairs<'a> {
    /// Current containers with no target counterpart, including spurious
    /// older duplicates.
    pub remove: Vec<ServicePair<'a>>,
    /// Target services with no current container.
    pub install: Vec<ServicePair<'a>>,
    /// Services present on both sides that differ.
    pub update: Vec<ServicePair<'a>>,
}

impl<'a> ServicePairs<'a> {
    /// Install and update pairs: services still waiting to reach their target.
    pub fn pending(&self) -> impl Iterator<Item = &ServicePair<'a>> {
        self.install.iter().chain(self.update.iter())
    }

    /// Remove and update pairs: services already being replaced or removed.
    pub fn changing(&self) -> Vec<ServicePair<'a>> {
        self.remove.iter().chain(self.update.iter()).copied().collect()
    }
}

/// A current/target pair of a network or volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityPair<'a, T> {
    pub current: Option<&'a T>,
    pub target: Option<&'a T>,
}

/// Compare current and target services of one app.
///
/// When several current containers share a service id (mid-handover), the
/// newest one is the update candidate and the others are removed.
pub fn compare_services<'a>(
    current: &'a [Service],
    target: &'a [Service],
    container_ids: &ContainerIds,
    started: &StartedContainers,
) -> ServicePairs<'a> {
    let current_ids: Vec<ServiceId> = current.iter().map(|s| s.service_id).unique().collect();
    let target_ids: Vec<ServiceId> = target.iter().map(|s| s.service_id).collect();

    let mut remove: Vec<ServicePair<'a>> = current
        .iter()
        .filter(|s| !target_ids.contains(&s.service_id))
        .map(|s| ServicePair {
            current: Some(s),
            target: None,
            service_id: s.service_id,
        })
        .collect();

    let (install, both): (Vec<ServicePair<'a>>, Vec<&'a Service>) =
        target.iter().partition_map(|t| {
            if current_ids.contains(&t.service_id) {
                Either::Right(t)
            } else {
                Either::Left(ServicePair {
                    current: None,
                    target: Some(t),
                    service_id: t.service_id,
                })
            }
        });

    let mut update = Vec::new();
    for target_service in both {
        let service_id = target_service.service_id;
        let containers: Vec<&'a Service> = current
            .iter()
            .filter(|s| s.service_id == service_id)
            .collect();

        let Some(newest) = containers
            .iter()
            .copied()
            .reduce(|best, s| if s.created_at > best.created_at { s } else { best })
        else {
            continue;
        };

        remove.extend(
            containers
                .iter()
                .filter(|s| !std::ptr::eq(**s, newest))
                .map(|s| ServicePair {
                    current: Some(*s),
                    target: None,
                    service_id,
                }),
        );

        if !newest.is_equal(target_service, container_ids)
            && !already_started(newest, target_service, container_ids, started)
        {
            update.push(ServicePair {
                current: Some(newest),
                target: Some(target_service),
                service_id,
            });
        }
    }

    ServicePairs {
        remove,
        install,
        update,
    }
}

/// The container matches its target except for running, the target wants
/// it running, and it was started before: it exited on its own.
fn already_started(
    current: &Service,
    target: &Service,
    container_ids: &ContainerIds,
    started: &StartedContainers,
) -> bool {
    current.is_equal_config(target, container_ids)
        && target.config.running
        && current
            .container_id
            .as_deref()
            .is_some_and(|id| started.contains(id))
}

fn compare_entities<'a, T>(
    current: &'a BTreeMap<String, T>,
    target: &'a BTreeMap<String, T>,
    is_equal_config: impl Fn(&T, &T) -> bool,
) -> Vec<EntityPair<'a, T>> {
    let removed = current
        .iter()
        .filter(|(name, _)| !target.contains_key(*name))
        .map(|(_, c)| EntityPair {
            current: Some(c),
            target: None,
        });

    let installed = target
        .iter()
        .filter(|(name, _)| !current.contains_key(*name))
        .map(|(_, t)| EntityPair {
            current: None,
            target: Some(t),
        });

    let updated = target.iter().filter_map(|(name, t)| {
        current
            .get(name)
            .filter(|c| !is_equal_config(c, t))
            .map(|c| EntityPair {
                current: Some(c),
                target: Some(t),
            })
    });

    removed.chain(installed).chain(updated).collect()
}

/// Compare networks by name.
pub fn compare_networks<'a>(
    current: &'a BTreeMap<String, Network>,
    target: &'a BTreeMap<String, Network>,
) -> Vec<EntityPair<'a, Network>> {
    compare_entities(current, target, Network::is_equal_config)
}

/// Compare volumes by name.
pub fn compare_volumes<'a>(
    current: &'a BTreeMap<String, Volume>,
    target: &'a BTreeMap<String, Volume>,
) -> Vec<EntityPair<'a, Volume>> {
    compare_entities(current, target, Volume::is_equal_config)
}
