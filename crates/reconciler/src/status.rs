//! Device status report.
//!
//! Services are reported per app and per image id. Two containers sharing an
//! image id are mid-handover. Images that do not back a container yet are
//! reported with their download progress.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{AppId, Image, ImageId, ReleaseId, Service, ServiceStatus};

/// Status of one service (or of the image it will run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<ReleaseId>,
    pub download_progress: Option<u8>,
}

/// Status of one app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReport {
    pub services: BTreeMap<ImageId, ServiceReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Status of an image held for dependent devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentImageReport {
    pub status: Option<String>,
    pub download_progress: Option<u8>,
}

/// The whole device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub local: BTreeMap<AppId, AppReport>,
    pub dependent: BTreeMap<AppId, BTreeMap<ImageId, DependentImageReport>>,
    /// The release every container runs, when they all agree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<ReleaseId>,
}

/// Assemble the status report.
///
/// # Errors
///
/// Returns `Error::InternalInconsistency` for a non-dependent image record
/// without an image id.
pub fn device_status(
    services: &[Service],
    images: &[Image],
    commits: &BTreeMap<AppId, String>,
) -> Result<DeviceStatus> {
    let mut status = DeviceStatus::default();
    let mut first_seen: BTreeMap<(AppId, ImageId), &Service> = BTreeMap::new();

    for service in services {
        let app = status.local.entry(service.app_id).or_default();
        let key = (service.app_id, service.image_id);
        match first_seen.get(&key).copied() {
            None => {
                app.services.insert(
                    service.image_id,
                    ServiceReport {
                        status: service.status.to_string(),
                        release_id: Some(service.release_id),
                        download_progress: None,
                    },
                );
                first_seen.insert(key, service);
            }
            Some(other) => {
                let older = if service.created_at < other.created_at {
                    service
                } else {
                    other
                };
                app.services.insert(
                    service.image_id,
                    ServiceReport {
                        status: ServiceStatus::HandingOver.to_string(),
                        release_id: Some(older.release_id),
                        download_progress: None,
                    },
                );
            }
        }
    }

    status.release_id = services
        .first()
        .map(|s| s.release_id)
        .filter(|first| services.iter().all(|s| s.release_id == *first));

    for image in images {
        match (image.dependent, image.image_id) {
            (false, None) => {
                return Err(Error::internal_inconsistency(format!(
                    "image {} has no image id",
                    image.name
                )));
            }
            (false, Some(image_id)) => {
                status
                    .local
                    .entry(image.app_id)
                    .or_default()
                    .services
                    .entry(image_id)
                    .or_insert_with(|| ServiceReport {
                        status: image.status.clone().unwrap_or_default(),
                        release_id: Some(image.release_id),
                        download_progress: image.download_progress,
                    });
            }
            (true, Some(image_id)) => {
                status.dependent.entry(image.app_id).or_default().insert(
                    image_id,
                    DependentImageReport {
                        status: image.status.clone(),
                        download_progress: image.download_progress,
                    },
                );
            }
            (true, None) => debug!(image = %image.name, "Ignoring legacy dependent image"),
        }
    }

    for (app_id, commit) in commits {
        if let Some(app) = status.local.get_mut(app_id) {
            app.commit = Some(commit.clone());
        }
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::model::{ServiceConfig, ServiceId};

    fn container(image_id: u32, release: u32, created: i64) -> Service {
        Service {
            app_id: AppId(1),
            service_id: ServiceId(1),
            service_name: "main".to_string(),
            release_id: ReleaseId(release),
            image_id: ImageId(image_id),
            image_name: "img".to_string(),
            container_id: Some(format!("c{created}")),
            status: ServiceStatus::Running,
            created_at: Utc.timestamp_opt(created, 0).single(),
            config: ServiceConfig::default(),
        }
    }

    fn image(image_id: Option<u32>, dependent: bool) -> Image {
        Image {
            name: "img".to_string(),
            app_id: AppId(1),
            service_id: ServiceId(2),
            service_name: "other".to_string(),
            image_id: image_id.map(ImageId),
            release_id: ReleaseId(2),
            dependent,
            docker_image_id: None,
            download_progress: Some(40),
            status: Some("Downloading".to_string()),
        }
    }

    #[test]
    fn running_service_is_reported_by_image_id() {
        let status = device_status(&[container(5, 1, 10)], &[], &BTreeMap::new());

        let report = status
            .ok()
            .and_then(|s| s.local.get(&AppId(1)).and_then(|a| a.services.get(&ImageId(5)).cloned()));
        assert_eq!(
            report,
            Some(ServiceReport {
                status: "Running".to_string(),
                release_id: Some(ReleaseId(1)),
                download_progress: None,
            })
        );
    }

    #[test]
    fn two_containers_sharing_image_are_handing_over() {
        let services = [container(5, 2, 20), container(5, 1, 10)];

        let status = device_status(&services, &[], &BTreeMap::new()).unwrap_or_default();

        let report = status.local.get(&AppId(1)).and_then(|a| a.services.get(&ImageId(5)));
        assert_eq!(report.map(|r| r.status.as_str()), Some("Handing over"));
        assert_eq!(report.and_then(|r| r.release_id), Some(ReleaseId(1)));
        assert_eq!(status.release_id, None);
    }

    #[test]
    fn images_without_container_report_progress() {
        let status =
            device_status(&[container(5, 1, 10)], &[image(Some(6), false)], &BTreeMap::new())
                .unwrap_or_default();

        let report = status.local.get(&AppId(1)).and_then(|a| a.services.get(&ImageId(6)));
        assert_eq!(report.and_then(|r| r.download_progress), Some(40));
        assert_eq!(status.release_id, Some(ReleaseId(1)));
    }

    #[test]
    fn dependent_images_are_separate() {
        let status = device_status(&[], &[image(Some(6), true), image(None, true)], &BTreeMap::new())
            .unwrap_or_default();

        assert!(status.local.is_empty());
        assert_eq!(status.dependent.get(&AppId(1)).map(BTreeMap::len), Some(1));
    }

    #[test]
    fn image_without_id_is_inconsistent() {
        let result = device_status(&[], &[image(None, false)], &BTreeMap::new());
        assert!(matches!(result, Err(Error::InternalInconsistency { .. })));
    }

    #[test]
    fn commit_is_stamped_on_app() {
        let commits = BTreeMap::from([(AppId(1), "abc".to_string())]);
        let status = device_status(&[container(5, 1, 10)], &[], &commits).unwrap_or_default();
        assert_eq!(
            status.local.get(&AppId(1)).and_then(|a| a.commit.clone()),
            Some("abc".to_string())
        );
    }
}
