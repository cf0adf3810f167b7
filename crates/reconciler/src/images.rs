//! Image lifecycle analysis: what to save, what to remove, what to delta from.

use itertools::Itertools;
use tracing::debug;

use crate::model::{Image, Service, ServiceStatus, StateSnapshot, UpdateStrategy};

/// Image bookkeeping a pass should do before touching any service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAnalysis {
    /// Target images present locally but missing their full record.
    pub to_save: Vec<Image>,
    /// Local images nobody needs anymore.
    pub to_remove: Vec<Image>,
}

/// Inputs of [`analyze_images`].
#[derive(Debug, Clone, Copy)]
pub struct ImageContext<'a> {
    pub current: &'a StateSnapshot,
    pub target: &'a StateSnapshot,
    pub available: &'a [Image],
    pub local_mode: bool,
    /// Image names still used by dependent devices.
    pub dependent_images: &'a [String],
}

/// Pick a local image to use as binary-diff base for `image`.
///
/// Prefers an image of the same service (not for dependent images), then any
/// image of the same app.
pub fn best_delta_source<'a>(image: &Image, available: &'a [Image]) -> Option<&'a str> {
    let same_service = (!image.dependent)
        .then(|| {
            available
                .iter()
                .find(|a| a.service_name == image.service_name && a.app_id == image.app_id)
        })
        .flatten();

    same_service
        .or_else(|| available.iter().find(|a| a.app_id == image.app_id))
        .map(|a| a.name.as_str())
}

/// Whether any local image is the one `service` runs.
pub fn is_available(service: &Service, available: &[Image]) -> bool {
    available.iter().any(|image| {
        image.docker_image_id.as_deref() == Some(service.config.image.as_str())
            || image.is_same_image(&service.image_name)
    })
}

/// Record of the image a current container runs, if it is known locally.
fn image_for_current(service: &Service, available: &[Image]) -> Option<Image> {
    let by_engine_id =
        |image: &&Image| image.docker_image_id.as_deref() == Some(service.config.image.as_str());

    available
        .iter()
        .filter(by_engine_id)
        .find(|image| image.image_id == Some(service.image_id))
        .or_else(|| available.iter().find(by_engine_id))
        .map(Image::identity)
}

/// Decide which images to save and which to remove.
pub fn analyze_images(ctx: &ImageContext<'_>) -> ImageAnalysis {
    let available_ids: Vec<Image> = ctx.available.iter().map(Image::identity).collect();

    let current_images: Vec<Image> = ctx
        .current
        .services()
        .filter_map(|s| image_for_current(s, ctx.available))
        .collect();
    let target_services: Vec<&Service> = ctx.target.services().collect();
    let target_images: Vec<Image> = target_services
        .iter()
        .map(|s| Image::for_service(s))
        .collect();

    let available_and_unused = available_ids
        .iter()
        .filter(|image| !current_images.contains(image) && !target_images.contains(image))
        .cloned();

    let to_download = target_images
        .iter()
        .filter(|t| !ctx.available.iter().any(|a| a.is_same_image(&t.name)));

    let to_save = if ctx.local_mode {
        Vec::new()
    } else {
        target_services
            .iter()
            .filter(|s| is_available(s, ctx.available))
            .map(|s| Image::for_service(s))
            .filter(|image| !available_ids.contains(image))
            .collect()
    };

    let delta_sources: Vec<&str> = to_download
        .filter_map(|image| best_delta_source(image, ctx.available))
        .collect();

    let delete_then_download = ctx
        .current
        .services()
        .filter(|s| {
            s.update_strategy() == UpdateStrategy::DeleteThenDownload
                && s.status == ServiceStatus::Stopped
        })
        .map(|s| image_for_current(s, ctx.available).unwrap_or_else(|| Image::for_service(s)));

    let to_remove = available_and_unused
        .chain(delete_then_download)
        .filter(|image| {
            let delta_base = delta_sources.contains(&image.name.as_str());
            let dependent = ctx
                .dependent_images
                .iter()
                .any(|name| image.is_same_image(name));
            if delta_base || dependent {
                debug!(image = %image.name, delta_base, dependent, "Keeping unused image");
            }
            !delta_base && !dependent
        })
        .unique_by(|image| image.identity())
        .collect();

    ImageAnalysis { to_save, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{App, AppId, ImageId, ReleaseId, ServiceConfig, ServiceId};

    fn service(app: u32, id: u32, name: &str, image: &str) -> Service {
        Service {
            app_id: AppId(app),
            service_id: ServiceId(id),
            service_name: name.to_string(),
            release_id: ReleaseId(1),
            image_id: ImageId(id),
            image_name: image.to_string(),
            container_id: None,
            status: ServiceStatus::Running,
            created_at: None,
            config: ServiceConfig {
                image: image.to_string(),
                running: true,
                ..ServiceConfig::default()
            },
        }
    }

    fn snapshot(services: Vec<Service>) -> StateSnapshot {
        let apps = services.into_iter().into_group_map_by(|s| s.app_id);
        StateSnapshot::from_apps(apps.into_iter().map(|(app_id, services)| App {
            services,
            ..App::empty(app_id)
        }))
    }

    fn local(service: &Service, docker_id: &str) -> Image {
        Image {
            docker_image_id: Some(docker_id.to_string()),
            ..Image::for_service(service)
        }
    }

    #[test]
    fn delta_source_prefers_same_service() {
        let a = service(1, 1, "a", "img-a");
        let b = service(1, 2, "b", "img-b");
        let available = vec![local(&b, "sha-b"), local(&a, "sha-a")];
        let wanted = Image::for_service(&service(1, 1, "a", "img-a-v2"));

        assert_eq!(best_delta_source(&wanted, &available), Some("img-a"));

        let other_app = Image::for_service(&service(2, 9, "z", "img-z"));
        assert_eq!(best_delta_source(&other_app, &available), None);
    }

    #[test]
    fn unused_images_are_removed() {
        let running = service(1, 1, "a", "img-a");
        let stale = service(1, 1, "a", "img-old");
        let available = vec![local(&running, "img-a"), local(&stale, "sha-old")];
        let current = snapshot(vec![running.clone()]);
        let target = snapshot(vec![running]);

        let analysis = analyze_images(&ImageContext {
            current: &current,
            target: &target,
            available: &available,
            local_mode: false,
            dependent_images: &[],
        });

        assert!(analysis.to_save.is_empty());
        assert_eq!(
            analysis.to_remove.iter().map(|i| i.name.as_str()).collect_vec(),
            vec!["img-old"]
        );
    }

    #[test]
    fn delta_base_and_dependent_images_are_kept() {
        let old = service(1, 1, "a", "img-old");
        let wanted = service(1, 1, "a", "img-new");
        let dep = service(1, 5, "dep", "img-dep");
        let available = vec![local(&old, "sha-old"), local(&dep, "sha-dep")];
        let current = snapshot(vec![]);
        let target = snapshot(vec![wanted]);

        let analysis = analyze_images(&ImageContext {
            current: &current,
            target: &target,
            available: &available,
            local_mode: false,
            dependent_images: &["img-dep".to_string()],
        });

        assert!(analysis.to_remove.is_empty());
    }

    #[test]
    fn image_present_under_other_record_is_saved() {
        let target_service = service(1, 1, "a", "registry/img-a");
        let mut found = local(&service(1, 7, "other", "other-name"), "sha-a");
        found.name = "registry/img-a".to_string();
        let current = snapshot(vec![]);
        let target = snapshot(vec![target_service.clone()]);

        let analysis = analyze_images(&ImageContext {
            current: &current,
            target: &target,
            available: &[found],
            local_mode: false,
            dependent_images: &[],
        });

        assert_eq!(analysis.to_save, vec![Image::for_service(&target_service)]);
    }

    #[test]
    fn local_mode_never_saves() {
        let target_service = service(1, 1, "a", "img-a");
        let mut found = local(&target_service, "sha-a");
        found.service_name = "renamed".to_string();
        let current = snapshot(vec![]);
        let target = snapshot(vec![target_service]);

        let analysis = analyze_images(&ImageContext {
            current: &current,
            target: &target,
            available: &[found],
            local_mode: true,
            dependent_images: &[],
        });

        assert!(analysis.to_save.is_empty());
    }

    #[test]
    fn stopped_delete_then_download_image_is_removed() {
        let mut stopped = service(1, 1, "a", "img-a");
        stopped.status = ServiceStatus::Stopped;
        stopped
            .config
            .labels
            .insert(crate::model::labels::UPDATE_STRATEGY.to_string(), "delete-then-download".to_string());
        let available = vec![local(&stopped, "img-a")];
        let current = snapshot(vec![stopped.clone()]);
        let mut restarted = stopped.clone();
        restarted.status = ServiceStatus::Installing;
        let target = snapshot(vec![restarted]);

        let analysis = analyze_images(&ImageContext {
            current: &current,
            target: &target,
            available: &available,
            local_mode: false,
            dependent_images: &[],
        });

        assert!(analysis.to_remove.iter().any(|i| i.name == "img-a"));
    }
}
