//! Per-app sequencing of removals, installs, updates, networks and volumes.

use tracing::debug;

use crate::compare::{compare_networks, compare_services, compare_volumes, ServicePair};
use crate::legacy::carry_over_legacy_identity;
use crate::model::{App, AppId, ContainerIds, Image, ImageId, ServiceStatus, StartedContainers};
use crate::network_step::{next_steps_for_network, next_steps_for_volume};
use crate::service_step::{next_step_for_service, ServiceContext};
use crate::step::{Step, StepKind};

/// Device-wide facts every app update needs.
#[derive(Debug, Clone, Copy)]
pub struct AppContext<'a> {
    pub local_mode: bool,
    pub container_ids: &'a ContainerIds,
    pub available: &'a [Image],
    pub downloading: &'a [ImageId],
    pub started: &'a StartedContainers,
}

/// Build the target app as it is diffed: the legacy shim applied and the
/// implicit default network added.
fn prepare_target(current: &App, target: Option<&App>, app_id: AppId) -> App {
    match target {
        Some(target) => {
            let mut prepared = target.clone().with_default_network();
            carry_over_legacy_identity(current, &mut prepared);
            prepared
        }
        None => App::empty(app_id),
    }
}

/// All steps one app needs this pass, each tagged with the app id.
pub fn next_steps_for_app(
    app_id: AppId,
    current: Option<&App>,
    target: Option<&App>,
    ctx: &AppContext<'_>,
) -> Vec<Step> {
    let current_app = current.cloned().unwrap_or_else(|| App::empty(app_id));
    let target_app = prepare_target(&current_app, target, app_id);

    let network_pairs = compare_networks(&current_app.networks, &target_app.networks);
    let volume_pairs = compare_volumes(&current_app.volumes, &target_app.volumes);
    let service_pairs = compare_services(
        &current_app.services,
        &target_app.services,
        ctx.container_ids,
        ctx.started,
    );

    let mut steps: Vec<Step> = service_pairs
        .remove
        .iter()
        .filter_map(|pair| pair.current)
        .map(|service| {
            if service.status == ServiceStatus::Stopping {
                Step::noop()
            } else {
                Step::kill(service)
            }
        })
        .collect();

    let pending: Vec<ServicePair<'_>> = service_pairs.pending().copied().collect();
    let service_ctx = ServiceContext {
        target_app: &target_app,
        network_pairs: &network_pairs,
        volume_pairs: &volume_pairs,
        pending: &pending,
        available: ctx.available,
        downloading: ctx.downloading,
        local_mode: ctx.local_mode,
        container_ids: ctx.container_ids,
    };
    steps.extend(
        pending
            .iter()
            .filter_map(|pair| next_step_for_service(pair, &service_ctx)),
    );

    let changing = service_pairs.changing();
    steps.extend(
        network_pairs
            .iter()
            .flat_map(|pair| next_steps_for_network(pair, &current_app, &changing)),
    );
    steps.extend(
        volume_pairs
            .iter()
            .flat_map(|pair| next_steps_for_volume(pair, &current_app, &changing)),
    );

    if steps.is_empty() {
        if let Some(commit) = target_app
            .commit
            .as_ref()
            .filter(|commit| current_app.commit.as_ref() != Some(*commit))
        {
            steps.push(
                StepKind::UpdateCommit {
                    target: commit.clone(),
                }
                .into(),
            );
        }
    }

    debug!(app_id = %app_id, steps = steps.len(), "Sequenced app");

    steps.into_iter().map(|step| step.with_app(app_id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{labels, Network, NetworkConfig, ReleaseId, Service, ServiceConfig, ServiceId};
    use crate::step::Action;

    fn service(id: u32, name: &str, image: &str) -> Service {
        Service {
            app_id: AppId(1),
            service_id: ServiceId(id),
            service_name: name.to_string(),
            release_id: ReleaseId(1),
            image_id: ImageId(id),
            image_name: image.to_string(),
            container_id: Some(format!("{name}-c")),
            status: ServiceStatus::Running,
            created_at: None,
            config: ServiceConfig {
                image: image.to_string(),
                running: true,
                network_mode: "1_default".to_string(),
                ..ServiceConfig::default()
            },
        }
    }

    fn app(services: Vec<Service>, commit: &str) -> App {
        let mut app = App {
            services,
            commit: Some(commit.to_string()),
            ..App::empty(AppId(1))
        };
        app.networks.insert(
            "default".to_string(),
            Network::from_compose("default", AppId(1), NetworkConfig::default()),
        );
        app
    }

    fn run(current: Option<&App>, target: Option<&App>, available: &[Image]) -> Vec<Step> {
        let ids = ContainerIds::new();
        let started = StartedContainers::new();
        let ctx = AppContext {
            local_mode: false,
            container_ids: &ids,
            available,
            downloading: &[],
            started: &started,
        };
        next_steps_for_app(AppId(1), current, target, &ctx)
    }

    fn local(service: &Service) -> Image {
        Image {
            docker_image_id: Some(service.config.image.clone()),
            ..Image::for_service(service)
        }
    }

    #[test]
    fn converged_app_with_new_commit_updates_commit() {
        let main = service(1, "main", "img");
        let current = app(vec![main.clone()], "old");
        let target = app(vec![main.clone()], "new");

        let steps = run(Some(&current), Some(&target), &[local(&main)]);

        assert_eq!(steps.len(), 1);
        assert!(matches!(
            steps.first(),
            Some(Step { kind: StepKind::UpdateCommit { target }, app_id: Some(AppId(1)) }) if target == "new"
        ));
    }

    #[test]
    fn converged_app_with_same_commit_is_empty() {
        let main = service(1, "main", "img");
        let current = app(vec![main.clone()], "c");
        let target = app(vec![main.clone()], "c");
        assert!(run(Some(&current), Some(&target), &[local(&main)]).is_empty());
    }

    #[test]
    fn removed_app_kills_services_before_touching_network() {
        let main = service(1, "main", "img");
        let current = app(vec![main], "c");

        let steps = run(Some(&current), None, &[]);

        let actions: Vec<Action> = steps.iter().map(Step::action).collect();
        assert_eq!(actions, vec![Action::Kill]);
    }

    fn hand_over(mut service: Service) -> Service {
        service
            .config
            .labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "hand-over".to_string());
        service
    }

    /// Given a hand-over service whose default network changes config
    /// When the app is sequenced with the new image already local
    /// Then the old container is killed first, since it cannot hand over on a network being replaced
    #[test]
    fn hand_over_on_changed_network_kills() {
        let current_main = service(1, "main", "img");
        let target_main = hand_over(service(1, "main", "img-new"));
        let current = app(vec![current_main.clone()], "c");
        let mut target = app(vec![target_main.clone()], "c");
        target.networks.insert(
            "default".to_string(),
            Network::from_compose(
                "default",
                AppId(1),
                NetworkConfig {
                    internal: true,
                    ..NetworkConfig::default()
                },
            ),
        );

        let steps = run(
            Some(&current),
            Some(&target),
            &[local(&current_main), local(&target_main)],
        );

        let actions: Vec<Action> = steps.iter().map(Step::action).collect();
        assert_eq!(actions, vec![Action::Kill]);
    }

    /// Given a preloaded legacy container without a matching service id
    /// When its app is sequenced against a target with a new release
    /// Then the container is updated in place instead of removed and reinstalled
    #[test]
    fn legacy_container_is_updated_not_reinstalled() {
        let mut legacy = service(0, "main", "img");
        legacy
            .config
            .labels
            .insert(labels::LEGACY_CONTAINER.to_string(), "true".to_string());
        let mut target_main = service(42, "main", "img");
        target_main.image_id = legacy.image_id;
        target_main.release_id = ReleaseId(2);
        let current = app(vec![legacy], "c");
        let target = app(vec![target_main.clone()], "c");

        let steps = run(Some(&current), Some(&target), &[local(&target_main)]);

        let actions: Vec<Action> = steps.iter().map(Step::action).collect();
        assert_eq!(actions, vec![Action::UpdateMetadata]);
        assert!(steps.iter().all(|step| step.app_id == Some(AppId(1))));
    }

    #[test]
    fn fresh_install_creates_default_network_and_fetches() {
        let main = service(1, "main", "img");
        let mut target = app(vec![main], "c");
        target.networks.clear();

        let steps = run(None, Some(&target), &[]);

        let actions: Vec<Action> = steps.iter().map(Step::action).collect();
        assert_eq!(actions, vec![Action::Fetch, Action::CreateNetwork]);
    }
}
