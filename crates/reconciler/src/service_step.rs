//! Single next step for one service pair.

use tracing::debug;

use crate::compare::{EntityPair, ServicePair};
use crate::images::is_available;
use crate::model::{App, ContainerIds, Image, ImageId, Network, Service, ServiceStatus, UpdateStrategy, Volume};
use crate::step::Step;

/// What the resolver knows about the rest of the app update.
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    pub target_app: &'a App,
    pub network_pairs: &'a [EntityPair<'a, Network>],
    pub volume_pairs: &'a [EntityPair<'a, Volume>],
    /// Install and update pairs of the app.
    pub pending: &'a [ServicePair<'a>],
    pub available: &'a [Image],
    pub downloading: &'a [ImageId],
    pub local_mode: bool,
    pub container_ids: &'a ContainerIds,
}

/// Resolve the next step for an install or update pair.
///
/// `None` means the service waits this pass without signalling busy.
pub fn next_step_for_service(pair: &ServicePair<'_>, ctx: &ServiceContext<'_>) -> Option<Step> {
    match pair.current.map(|c| c.status) {
        Some(ServiceStatus::Stopping) => return Some(Step::noop()),
        Some(ServiceStatus::Dead) => return pair.current.map(Step::remove),
        _ => {}
    }

    let target = pair.target?;

    let needs_download = !ctx.local_mode && !is_available(target, ctx.available);
    if needs_download && ctx.downloading.contains(&target.image_id) {
        debug!(service = %target.service_name, "Image is downloading, waiting");
        return Some(Step::noop());
    }

    let deps_for_start = || dependencies_met_for_start(target, ctx);
    let deps_for_kill = || !needs_download && dependencies_met_for_kill(target, ctx);

    let Some(current) = pair.current else {
        // New service, or the old container is already gone.
        return if needs_download {
            Some(Step::fetch(target))
        } else if deps_for_start() {
            Some(Step::start(None, target))
        } else {
            debug!(service = %target.service_name, "Dependencies not met for start");
            None
        };
    };

    if current.is_equal_config(target, ctx.container_ids) {
        return Some(update_container_step(current, target));
    }

    let strategy = target.update_strategy();
    debug!(
        service = %target.service_name,
        strategy = strategy.as_str(),
        needs_download,
        "Resolving service update"
    );

    let step = match strategy {
        UpdateStrategy::DownloadThenKill => {
            if needs_download {
                Step::fetch(target)
            } else if deps_for_kill() {
                Step::kill_for(current, target)
            } else {
                Step::noop()
            }
        }
        UpdateStrategy::KillThenDownload | UpdateStrategy::DeleteThenDownload => {
            Step::kill_for(current, target)
        }
        UpdateStrategy::HandOver => {
            if needs_download {
                Step::fetch(target)
            } else if needs_special_kill(current, ctx) && deps_for_kill() {
                Step::kill_for(current, target)
            } else if deps_for_start() {
                Step::handover(current, target, target.handover_timeout())
            } else {
                Step::noop()
            }
        }
    };
    Some(step)
}

/// Steps that do not need a new container.
fn update_container_step(current: &Service, target: &Service) -> Step {
    if current.release_id != target.release_id || current.image_id != target.image_id {
        Step::update_metadata(current, target)
    } else if target.config.running {
        Step::start(Some(current), target)
    } else {
        Step::stop(current, target)
    }
}

/// No dependency is still pending, and no network or volume the target uses
/// is about to be (re)created.
fn dependencies_met_for_start(target: &Service, ctx: &ServiceContext<'_>) -> bool {
    let dependency_pending = target.config.depends_on.iter().any(|dependency| {
        ctx.pending
            .iter()
            .any(|pair| pair.target.is_some_and(|t| &t.service_name == dependency))
    });
    if dependency_pending {
        return false;
    }

    let network_pending = ctx
        .network_pairs
        .iter()
        .filter_map(|pair| pair.target)
        .any(|network| target.uses_network(&network.name));
    let volume_pending = ctx
        .volume_pairs
        .iter()
        .filter_map(|pair| pair.target)
        .any(|volume| target.uses_volume(&volume.name));

    !network_pending && !volume_pending
}

/// Every dependency already has its image locally, so killing now keeps
/// downtime short. A dependency that is not a service of the app is not
/// waited on.
fn dependencies_met_for_kill(target: &Service, ctx: &ServiceContext<'_>) -> bool {
    if ctx.local_mode {
        return true;
    }
    target.config.depends_on.iter().all(|dependency| {
        ctx.target_app
            .services
            .iter()
            .find(|s| &s.service_name == dependency)
            .is_none_or(|s| is_available(s, ctx.available))
    })
}

/// The running container uses a network or volume that changes this pass.
fn needs_special_kill(current: &Service, ctx: &ServiceContext<'_>) -> bool {
    ctx.network_pairs
        .iter()
        .filter_map(|pair| pair.current)
        .any(|network| current.uses_network(&network.name))
        || ctx
            .volume_pairs
            .iter()
            .filter_map(|pair| pair.current)
            .any(|volume| current.uses_volume(&volume.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{labels, AppId, ReleaseId, ServiceConfig, ServiceId};
    use crate::step::{Action, StepKind};

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

    fn local(service: &Service) -> Image {
        Image {
            docker_image_id: Some(service.config.image.clone()),
            ..Image::for_service(service)
        }
    }

    struct Fixture {
        app: App,
        available: Vec<Image>,
        downloading: Vec<ImageId>,
        ids: ContainerIds,
    }

    impl Fixture {
        fn new(target_services: Vec<Service>, available: Vec<Image>) -> Self {
            Self {
                app: App {
                    services: target_services,
                    ..App::empty(AppId(1))
                },
                available,
                downloading: Vec::new(),
                ids: ContainerIds::new(),
            }
        }

        fn resolve(&self, current: Option<&Service>, target: &Service, pending: &[ServicePair<'_>]) -> Option<Step> {
            let ctx = ServiceContext {
                target_app: &self.app,
                network_pairs: &[],
                volume_pairs: &[],
                pending,
                available: &self.available,
                downloading: &self.downloading,
                local_mode: false,
                container_ids: &self.ids,
            };
            let pair = ServicePair {
                current,
                target: Some(target),
                service_id: target.service_id,
            };
            next_step_for_service(&pair, &ctx)
        }
    }

    fn action(step: Option<&Step>) -> Option<Action> {
        step.map(Step::action)
    }

    #[test]
    fn stopping_service_waits() {
        let mut current = service(1, "main", "img");
        current.status = ServiceStatus::Stopping;
        let target = service(1, "main", "img-v2");
        let fixture = Fixture::new(vec![target.clone()], vec![]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Noop));
    }

    #[test]
    fn dead_service_is_removed() {
        let mut current = service(1, "main", "img");
        current.status = ServiceStatus::Dead;
        let target = service(1, "main", "img");
        let fixture = Fixture::new(vec![target.clone()], vec![]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Remove));
    }

    #[test]
    fn running_flag_flip_starts() {
        let mut current = service(1, "main", "img");
        current.config.running = false;
        let target = service(1, "main", "img");
        let fixture = Fixture::new(vec![target.clone()], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Start));
    }

    #[test]
    fn running_flag_flip_stops() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img");
        target.config.running = false;
        let fixture = Fixture::new(vec![target.clone()], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Stop));
    }

    #[test]
    fn release_change_updates_metadata() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img");
        target.release_id = ReleaseId(2);
        let fixture = Fixture::new(vec![target.clone()], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::UpdateMetadata));
    }

    #[test]
    fn default_strategy_fetches_before_kill() {
        let current = service(1, "main", "img");
        let target = service(1, "main", "img-new");
        let fixture = Fixture::new(vec![target.clone()], vec![local(&current)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert!(matches!(
            step.as_ref().map(|s| &s.kind),
            Some(StepKind::Fetch { image, .. }) if image.name == "img-new"
        ));
    }

    #[test]
    fn default_strategy_kills_once_image_is_local() {
        let current = service(1, "main", "img");
        let target = service(1, "main", "img-new");
        let fixture = Fixture::new(vec![target.clone()], vec![local(&current), local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Kill));
    }

    #[test]
    fn downloading_image_waits() {
        let current = service(1, "main", "img");
        let target = service(1, "main", "img-new");
        let mut fixture = Fixture::new(vec![target.clone()], vec![]);
        fixture.downloading.push(target.image_id);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Noop));
    }

    #[test]
    fn kill_then_download_kills_immediately() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img-new");
        target
            .config
            .labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "kill-then-download".to_string());
        let fixture = Fixture::new(vec![target.clone()], vec![]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Kill));
    }

    #[test]
    fn unmet_dependency_blocks_kill() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img-new");
        target.config.depends_on = vec!["dep".to_string()];
        let dep = service(2, "dep", "dep-img-new");
        let fixture = Fixture::new(vec![target.clone(), dep], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Noop));
    }

    #[test]
    fn missing_dependency_service_does_not_block() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img-new");
        target.config.depends_on = vec!["ghost".to_string()];
        let fixture = Fixture::new(vec![target.clone()], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Kill));
    }

    #[test]
    fn install_waits_for_pending_dependency() {
        let mut target = service(1, "main", "img");
        target.config.depends_on = vec!["dep".to_string()];
        let dep = service(2, "dep", "dep-img");
        let fixture = Fixture::new(vec![target.clone(), dep.clone()], vec![local(&target)]);
        let pending = [ServicePair {
            current: None,
            target: Some(&dep),
            service_id: dep.service_id,
        }];

        assert!(fixture.resolve(None, &target, &pending).is_none());
        assert_eq!(action(fixture.resolve(None, &target, &[]).as_ref()), Some(Action::Start));
    }

    fn hand_over(mut service: Service) -> Service {
        service
            .config
            .labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "hand-over".to_string());
        service
    }

    #[test]
    fn handover_fetches_missing_image_first() {
        let current = service(1, "main", "img");
        let target = hand_over(service(1, "main", "img-new"));
        let fixture = Fixture::new(vec![target.clone()], vec![local(&current)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert_eq!(action(step.as_ref()), Some(Action::Fetch));
    }

    #[test]
    fn handover_waits_for_pending_dependency() {
        let current = service(1, "main", "img");
        let mut target = hand_over(service(1, "main", "img-new"));
        target.config.depends_on = vec!["dep".to_string()];
        let dep = service(2, "dep", "dep-img");
        let fixture = Fixture::new(
            vec![target.clone(), dep.clone()],
            vec![local(&target), local(&dep)],
        );
        let pending = [ServicePair {
            current: None,
            target: Some(&dep),
            service_id: dep.service_id,
        }];

        let step = fixture.resolve(Some(&current), &target, &pending);
        assert_eq!(action(step.as_ref()), Some(Action::Noop));
    }

    #[test]
    fn handover_runs_side_by_side() {
        let current = service(1, "main", "img");
        let mut target = service(1, "main", "img-new");
        target
            .config
            .labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "hand-over".to_string());
        target
            .config
            .labels
            .insert(labels::HANDOVER_TIMEOUT.to_string(), "60000".to_string());
        let fixture = Fixture::new(vec![target.clone()], vec![local(&target)]);

        let step = fixture.resolve(Some(&current), &target, &[]);
        assert!(matches!(
            step.map(|s| s.kind),
            Some(StepKind::Handover { timeout: Some(60_000), .. })
        ));
    }
}
