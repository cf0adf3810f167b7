//! Device state model: services, networks, volumes, images and apps.
//!
//! Both current and target state are expressed with these types. Current
//! state is assembled from what the collaborators report; target state is
//! normalised from compose-like records with [`App::from_compose`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::ServiceContract;
use crate::error::{Error, Result};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Get the raw numeric value.
            pub fn value(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Application identifier; the join key across all snapshots.
    AppId
);
numeric_id!(
    /// Service identifier, unique within an app.
    ServiceId
);
numeric_id!(
    /// Identifier of an image record in the target state.
    ImageId
);
numeric_id!(
    /// Release identifier.
    ReleaseId
);

/// Parse an app id used as a map key.
///
/// # Errors
///
/// Returns `Error::InvalidAppId` when the key is not an unsigned integer.
pub fn parse_app_id(raw: &str) -> Result<AppId> {
    raw.trim()
        .parse::<u32>()
        .map(AppId)
        .map_err(|_| Error::invalid_app_id(raw))
}

/// Well-known container labels.
pub mod labels {
    pub const UPDATE_STRATEGY: &str = "io.balena.update.strategy";
    pub const HANDOVER_TIMEOUT: &str = "io.balena.update.handover-timeout";
    pub const LEGACY_CONTAINER: &str = "io.balena.legacy-container";
    pub const SERVICE_ID: &str = "io.balena.service-id";
    pub const SUPERVISOR_API: &str = "io.balena.features.supervisor-api";
    pub const OPTIONAL: &str = "io.balena.features.optional";
}

/// Whether a label value reads as true.
pub fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "on")
    )
}

/// Service name to engine container id, per app.
pub type ContainerIds = BTreeMap<String, String>;

/// Per-service update strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Fetch the new image, then kill the old container.
    #[default]
    DownloadThenKill,
    /// Kill first, download afterwards.
    KillThenDownload,
    /// Kill, delete the old image, then download.
    DeleteThenDownload,
    /// Run old and new side by side, then retire the old one.
    HandOver,
}

impl UpdateStrategy {
    /// Parse a label value. Missing or unknown values fall back to the default.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("kill-then-download") => Self::KillThenDownload,
            Some("delete-then-download") => Self::DeleteThenDownload,
            Some("hand-over") => Self::HandOver,
            _ => Self::DownloadThenKill,
        }
    }

    /// Label spelling of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DownloadThenKill => "download-then-kill",
            Self::KillThenDownload => "kill-then-download",
            Self::DeleteThenDownload => "delete-then-download",
            Self::HandOver => "hand-over",
        }
    }
}

/// Lifecycle status of a service container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    Installing,
    Installed,
    Running,
    Stopping,
    Stopped,
    Exited,
    Dead,
    #[serde(rename = "Handing over")]
    HandingOver,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Exited => "Exited",
            Self::Dead => "Dead",
            Self::HandingOver => "Handing over",
        };
        f.write_str(s)
    }
}

fn default_true() -> bool {
    true
}

/// Container configuration of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Engine image reference: an image id when known, else the image name.
    pub image: String,
    #[serde(default = "default_true")]
    pub running: bool,
    pub labels: BTreeMap<String, String>,
    /// Volume bindings, `source:dest[:mode]`.
    pub volumes: Vec<String>,
    pub network_mode: String,
    pub depends_on: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub restart: String,
}

/// A desired or observed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub service_name: String,
    #[serde(default)]
    pub release_id: ReleaseId,
    #[serde(default)]
    pub image_id: ImageId,
    #[serde(default)]
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: ServiceConfig,
}

impl Service {
    /// Build a target service from a compose-like record.
    ///
    /// `docker_image_id` is the engine id of the image when it is already
    /// present locally.
    pub fn from_compose(
        record: &ComposeService,
        app_id: AppId,
        release_id: ReleaseId,
        docker_image_id: Option<&str>,
    ) -> Self {
        let network_mode = match record.network_mode.as_deref() {
            None | Some("") => format!("{app_id}_default"),
            Some(mode @ ("host" | "none")) => mode.to_string(),
            Some(mode) if mode.starts_with("service:") || mode.starts_with("container:") => {
                mode.to_string()
            }
            Some(name) => format!("{app_id}_{name}"),
        };

        let volumes = record
            .volumes
            .iter()
            .map(|definition| scope_named_volume(app_id, definition))
            .collect();

        Self {
            app_id,
            service_id: record.service_id,
            service_name: record.service_name.clone(),
            release_id,
            image_id: record.image_id,
            image_name: record.image.clone(),
            container_id: None,
            status: ServiceStatus::Installing,
            created_at: None,
            config: ServiceConfig {
                image: docker_image_id.map_or_else(|| record.image.clone(), str::to_string),
                running: record.running.unwrap_or(true),
                labels: record.labels.clone(),
                volumes,
                network_mode,
                depends_on: record.depends_on.clone(),
                environment: record.environment.clone(),
                command: record.command.clone(),
                restart: record.restart.clone().unwrap_or_else(|| "always".to_string()),
            },
        }
    }

    /// Everything except the running flag matches.
    ///
    /// A `container:<id>` network mode is read as the `service:<name>`
    /// reference it was resolved from when the id is in `container_ids`.
    pub fn is_equal_config(&self, other: &Self, container_ids: &ContainerIds) -> bool {
        let mine = normalise_network_mode(&self.config.network_mode, container_ids);
        let theirs = normalise_network_mode(&other.config.network_mode, container_ids);

        mine == theirs
            && self.config.image == other.config.image
            && self.config.labels == other.config.labels
            && sorted(&self.config.volumes) == sorted(&other.config.volumes)
            && self.config.depends_on == other.config.depends_on
            && self.config.environment == other.config.environment
            && self.config.command == other.config.command
            && self.config.restart == other.config.restart
    }

    /// Config-equal and the running flags agree.
    pub fn is_equal(&self, other: &Self, container_ids: &ContainerIds) -> bool {
        self.is_equal_config(other, container_ids) && self.config.running == other.config.running
    }

    /// Look up a label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    /// Update strategy declared by the labels.
    pub fn update_strategy(&self) -> UpdateStrategy {
        UpdateStrategy::from_label(self.label(labels::UPDATE_STRATEGY))
    }

    /// Handover timeout in milliseconds, if declared and numeric.
    pub fn handover_timeout(&self) -> Option<u64> {
        self.label(labels::HANDOVER_TIMEOUT)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the service needs the supervisor API network.
    pub fn needs_supervisor_api(&self) -> bool {
        is_truthy(self.label(labels::SUPERVISOR_API))
    }

    /// App-local names of the named volumes this service mounts.
    pub fn named_volumes(&self) -> Vec<String> {
        let prefix = format!("{}_", self.app_id);
        self.config
            .volumes
            .iter()
            .filter_map(|definition| {
                let (source, _) = split_volume(definition)?;
                source.strip_prefix(&prefix).map(str::to_string)
            })
            .collect()
    }

    /// Whether the service runs attached to the app network `name`.
    pub fn uses_network(&self, name: &str) -> bool {
        self.config.network_mode == format!("{}_{name}", self.app_id)
    }

    /// Whether the service mounts the app volume `name`.
    pub fn uses_volume(&self, name: &str) -> bool {
        let engine_name = format!("{}_{name}", self.app_id);
        self.config.volumes.iter().any(|definition| {
            split_volume(definition).is_some_and(|(source, _)| source == engine_name)
        })
    }
}

fn sorted(values: &[String]) -> Vec<&String> {
    let mut out: Vec<&String> = values.iter().collect();
    out.sort();
    out
}

/// Split `source:dest[:mode]`; `None` for anonymous volumes.
fn split_volume(definition: &str) -> Option<(&str, &str)> {
    let mut parts = definition.splitn(3, ':');
    let source = parts.next()?;
    let dest = parts.next()?;
    Some((source, dest))
}

fn scope_named_volume(app_id: AppId, definition: &str) -> String {
    match split_volume(definition) {
        Some((source, _)) if !source.starts_with('/') && !source.is_empty() => {
            let rest = definition.get(source.len()..).unwrap_or_default();
            format!("{app_id}_{source}{rest}")
        }
        _ => definition.to_string(),
    }
}

fn normalise_network_mode(mode: &str, container_ids: &ContainerIds) -> String {
    mode.strip_prefix("container:")
        .and_then(|id| {
            container_ids
                .iter()
                .find(|(_, container_id)| container_id.as_str() == id)
                .map(|(name, _)| format!("service:{name}"))
        })
        .unwrap_or_else(|| mode.to_string())
}

/// IPAM settings of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpamConfig {
    pub driver: String,
    pub config: Vec<BTreeMap<String, String>>,
    pub options: BTreeMap<String, String>,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            driver: "default".to_string(),
            config: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub driver: String,
    pub ipam: IpamConfig,
    pub enable_ipv6: bool,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            driver: "bridge".to_string(),
            ipam: IpamConfig::default(),
            enable_ipv6: false,
            internal: false,
            labels: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }
}

/// An app network, identified by `(app_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub app_id: AppId,
    pub name: String,
    #[serde(default)]
    pub config: NetworkConfig,
}

impl Network {
    /// Build a target network.
    pub fn from_compose(name: impl Into<String>, app_id: AppId, config: NetworkConfig) -> Self {
        Self {
            app_id,
            name: name.into(),
            config,
        }
    }

    /// Name of the network on the engine.
    pub fn engine_name(&self) -> String {
        format!("{}_{}", self.app_id, self.name)
    }

    /// Driver, IPAM, flags, labels and options match.
    pub fn is_equal_config(&self, other: &Self) -> bool {
        self.config == other.config
    }
}

/// Volume configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeConfig {
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            driver: "local".to_string(),
            driver_opts: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// An app volume, identified by `(app_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub app_id: AppId,
    pub name: String,
    #[serde(default)]
    pub config: VolumeConfig,
}

impl Volume {
    /// Build a target volume.
    pub fn from_compose(name: impl Into<String>, app_id: AppId, config: VolumeConfig) -> Self {
        Self {
            app_id,
            name: name.into(),
            config,
        }
    }

    /// Name of the volume on the engine.
    pub fn engine_name(&self) -> String {
        format!("{}_{}", self.app_id, self.name)
    }

    /// Driver, driver options and labels match.
    pub fn is_equal_config(&self, other: &Self) -> bool {
        self.config == other.config
    }
}

/// An image as tracked by the image store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<ImageId>,
    #[serde(default)]
    pub release_id: ReleaseId,
    #[serde(default)]
    pub dependent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Image {
    /// The image a target service runs.
    pub fn for_service(service: &Service) -> Self {
        Self {
            name: service.image_name.clone(),
            app_id: service.app_id,
            service_id: service.service_id,
            service_name: service.service_name.clone(),
            image_id: Some(service.image_id),
            release_id: service.release_id,
            dependent: false,
            docker_image_id: None,
            download_progress: None,
            status: None,
        }
    }

    /// The record without its ephemeral engine id, progress and status.
    pub fn identity(&self) -> Self {
        Self {
            docker_image_id: None,
            download_progress: None,
            status: None,
            ..self.clone()
        }
    }

    /// Whether `name` refers to the same image as this record.
    pub fn is_same_image(&self, name: &str) -> bool {
        is_same_image_name(&self.name, name)
    }
}

/// Compare image references: equal after normalisation, or sharing a digest.
pub fn is_same_image_name(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (digest_of(a), digest_of(b)) {
        (Some(x), Some(y)) if x == y => return true,
        _ => {}
    }
    normalise_image_name(a) == normalise_image_name(b)
}

fn digest_of(name: &str) -> Option<&str> {
    name.split_once('@').map(|(_, digest)| digest)
}

/// Add the implicit `:latest` tag and drop the implicit Docker Hub prefixes.
pub fn normalise_image_name(name: &str) -> String {
    let (repo, digest) = match name.split_once('@') {
        Some((repo, digest)) => (repo, Some(digest)),
        None => (name, None),
    };
    let repo = repo
        .strip_prefix("docker.io/library/")
        .or_else(|| repo.strip_prefix("docker.io/"))
        .or_else(|| repo.strip_prefix("library/"))
        .unwrap_or(repo);
    let last_segment = repo.rsplit('/').next().unwrap_or(repo);

    match digest {
        Some(digest) => format!("{repo}@{digest}"),
        None if last_segment.contains(':') => repo.to_string(),
        None => format!("{repo}:latest"),
    }
}

/// An application: services, networks and volumes sharing an app id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub app_id: AppId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<ReleaseId>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,
}

impl App {
    /// The empty shell standing in for an absent app.
    pub fn empty(app_id: AppId) -> Self {
        Self {
            app_id,
            ..Self::default()
        }
    }

    /// Add the implicit `default` network when the app declares none by that name.
    pub fn with_default_network(mut self) -> Self {
        let app_id = self.app_id;
        self.networks
            .entry("default".to_string())
            .or_insert_with(|| Network::from_compose("default", app_id, NetworkConfig::default()));
        self
    }

    /// Normalise a compose-like target record.
    ///
    /// Named volumes used by a service but not declared by the app are
    /// added app-wide so they can be tracked and purged later. This is
    /// deprecated behaviour kept for older releases.
    pub fn from_compose<F>(app_id: AppId, record: &ComposeApp, resolve_image: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let release_id = record.release_id.unwrap_or_default();

        let services: Vec<Service> = record
            .services
            .iter()
            .map(|s| {
                let docker_id = resolve_image(&s.image);
                Service::from_compose(s, app_id, release_id, docker_id.as_deref())
            })
            .collect();

        let networks = record
            .networks
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Network::from_compose(name.clone(), app_id, config.clone()),
                )
            })
            .collect();

        let mut volumes: BTreeMap<String, Volume> = record
            .volumes
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Volume::from_compose(name.clone(), app_id, config.clone()),
                )
            })
            .collect();

        for name in services.iter().flat_map(Service::named_volumes) {
            volumes
                .entry(name.clone())
                .or_insert_with(|| Volume::from_compose(name, app_id, VolumeConfig::default()));
        }

        Self {
            app_id,
            name: record.name.clone(),
            commit: record.commit.clone(),
            release_id: record.release_id,
            services,
            networks,
            volumes,
        }
    }
}

/// A full device snapshot, keyed by app id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub apps: BTreeMap<AppId, App>,
}

impl StateSnapshot {
    /// Build from apps keyed by their string ids.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAppId` for a key that is not an integer.
    pub fn from_keyed(apps: BTreeMap<String, App>) -> Result<Self> {
        apps.into_iter()
            .map(|(key, mut app)| {
                let app_id = parse_app_id(&key)?;
                app.app_id = app_id;
                Ok((app_id, app))
            })
            .collect::<Result<BTreeMap<_, _>>>()
            .map(|apps| Self { apps })
    }

    /// Build from a list of apps.
    pub fn from_apps(apps: impl IntoIterator<Item = App>) -> Self {
        Self {
            apps: apps.into_iter().map(|app| (app.app_id, app)).collect(),
        }
    }

    /// Look up an app.
    pub fn app(&self, app_id: AppId) -> Option<&App> {
        self.apps.get(&app_id)
    }

    /// Every service of every app.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.apps.values().flat_map(|app| app.services.iter())
    }
}

/// A target service as written by the cloud or a local API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeService {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image: String,
    pub image_id: ImageId,
    pub running: Option<bool>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub network_mode: Option<String>,
    pub depends_on: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub restart: Option<String>,
    pub contract: Option<ServiceContract>,
}

impl ComposeService {
    /// Whether the service may be left out when its contract is unmet.
    pub fn is_optional(&self) -> bool {
        is_truthy(self.labels.get(labels::OPTIONAL).map(String::as_str))
    }
}

/// A target app as written by the cloud or a local API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeApp {
    pub name: Option<String>,
    pub commit: Option<String>,
    pub release_id: Option<ReleaseId>,
    pub services: Vec<ComposeService>,
    pub networks: BTreeMap<String, NetworkConfig>,
    pub volumes: BTreeMap<String, VolumeConfig>,
}

/// Caller-owned memo of containers that were started at least once.
///
/// Consulted by the comparator so a container that legitimately exited is
/// not restarted in a loop. Entries are cleared once a kill is accepted.
#[derive(Debug, Clone, Default)]
pub struct StartedContainers {
    ids: HashSet<String>,
}

impl StartedContainers {
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a start.
    pub fn record(&mut self, container_id: impl Into<String>) {
        self.ids.insert(container_id.into());
    }

    /// Forget a container.
    pub fn clear(&mut self, container_id: &str) {
        self.ids.remove(container_id);
    }

    /// Whether the container was started before.
    pub fn contains(&self, container_id: &str) -> bool {
        self.ids.contains(container_id)
    }
}
