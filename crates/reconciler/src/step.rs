//! Steps: the atomic operations a reconciliation pass emits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{AppId, Image, Network, Service, ServiceId, Volume};

/// Action name of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Fetch,
    Kill,
    Remove,
    Start,
    Stop,
    Handover,
    UpdateMetadata,
    CreateNetwork,
    RemoveNetwork,
    CreateVolume,
    RemoveVolume,
    SaveImage,
    RemoveImage,
    Cleanup,
    EnsureSupervisorNetwork,
    UpdateCommit,
    Noop,
    Dependent,
}

impl Action {
    /// Actions owned by the reconciler itself.
    pub const ALL: [Self; 17] = [
        Self::Fetch,
        Self::Kill,
        Self::Remove,
        Self::Start,
        Self::Stop,
        Self::Handover,
        Self::UpdateMetadata,
        Self::CreateNetwork,
        Self::RemoveNetwork,
        Self::CreateVolume,
        Self::RemoveVolume,
        Self::SaveImage,
        Self::RemoveImage,
        Self::Cleanup,
        Self::EnsureSupervisorNetwork,
        Self::UpdateCommit,
        Self::Noop,
    ];

    /// Parse an action name of the reconciler's own vocabulary.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAction` for any other name.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == name)
            .ok_or_else(|| Error::invalid_action(name))
    }

    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Kill => "kill",
            Self::Remove => "remove",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Handover => "handover",
            Self::UpdateMetadata => "updateMetadata",
            Self::CreateNetwork => "createNetwork",
            Self::RemoveNetwork => "removeNetwork",
            Self::CreateVolume => "createVolume",
            Self::RemoveVolume => "removeVolume",
            Self::SaveImage => "saveImage",
            Self::RemoveImage => "removeImage",
            Self::Cleanup => "cleanup",
            Self::EnsureSupervisorNetwork => "ensureSupervisorNetwork",
            Self::UpdateCommit => "updateCommit",
            Self::Noop => "noop",
            Self::Dependent => "dependent",
        }
    }

    /// Whether the action disrupts a running service and so runs under the
    /// app's update lock.
    pub fn needs_lock(self) -> bool {
        matches!(
            self,
            Self::Kill | Self::Stop | Self::Remove | Self::UpdateMetadata | Self::Handover
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does, with the entities it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum StepKind {
    #[serde(rename_all = "camelCase")]
    Fetch {
        image: Image,
        service_id: ServiceId,
        service_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Kill {
        service_id: ServiceId,
        current: Service,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Service>,
    },
    #[serde(rename_all = "camelCase")]
    Remove {
        service_id: ServiceId,
        current: Service,
    },
    #[serde(rename_all = "camelCase")]
    Start {
        service_id: ServiceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<Service>,
        target: Service,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        service_id: ServiceId,
        current: Service,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Service>,
    },
    #[serde(rename_all = "camelCase")]
    Handover {
        service_id: ServiceId,
        current: Service,
        target: Service,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateMetadata {
        service_id: ServiceId,
        current: Service,
        target: Service,
    },
    CreateNetwork {
        target: Network,
    },
    RemoveNetwork {
        current: Network,
    },
    CreateVolume {
        target: Volume,
    },
    RemoveVolume {
        current: Volume,
    },
    SaveImage {
        image: Image,
    },
    RemoveImage {
        image: Image,
    },
    Cleanup,
    EnsureSupervisorNetwork,
    UpdateCommit {
        target: String,
    },
    Noop,
    /// A step owned by the dependent-device subsystem.
    Dependent {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// One step of a reconciliation pass, tagged with the app it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<AppId>,
}

impl From<StepKind> for Step {
    fn from(kind: StepKind) -> Self {
        Self { kind, app_id: None }
    }
}

impl Step {
    /// Tag the step with an app id.
    pub fn with_app(mut self, app_id: AppId) -> Self {
        self.app_id = Some(app_id);
        self
    }

    /// The step's action.
    pub fn action(&self) -> Action {
        match &self.kind {
            StepKind::Fetch { .. } => Action::Fetch,
            StepKind::Kill { .. } => Action::Kill,
            StepKind::Remove { .. } => Action::Remove,
            StepKind::Start { .. } => Action::Start,
            StepKind::Stop { .. } => Action::Stop,
            StepKind::Handover { .. } => Action::Handover,
            StepKind::UpdateMetadata { .. } => Action::UpdateMetadata,
            StepKind::CreateNetwork { .. } => Action::CreateNetwork,
            StepKind::RemoveNetwork { .. } => Action::RemoveNetwork,
            StepKind::CreateVolume { .. } => Action::CreateVolume,
            StepKind::RemoveVolume { .. } => Action::RemoveVolume,
            StepKind::SaveImage { .. } => Action::SaveImage,
            StepKind::RemoveImage { .. } => Action::RemoveImage,
            StepKind::Cleanup => Action::Cleanup,
            StepKind::EnsureSupervisorNetwork => Action::EnsureSupervisorNetwork,
            StepKind::UpdateCommit { .. } => Action::UpdateCommit,
            StepKind::Noop => Action::Noop,
            StepKind::Dependent { .. } => Action::Dependent,
        }
    }

    /// Name used in logs and events; dependent steps report their own name.
    pub fn action_name(&self) -> &str {
        match &self.kind {
            StepKind::Dependent { name, .. } => name,
            _ => self.action().as_str(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, StepKind::Noop)
    }

    pub fn noop() -> Self {
        StepKind::Noop.into()
    }

    /// Kill a container that is going away.
    pub fn kill(current: &Service) -> Self {
        StepKind::Kill {
            service_id: current.service_id,
            current: current.clone(),
            target: None,
        }
        .into()
    }

    /// Kill a container so it can be replaced by `target`.
    pub fn kill_for(current: &Service, target: &Service) -> Self {
        StepKind::Kill {
            service_id: target.service_id,
            current: current.clone(),
            target: Some(target.clone()),
        }
        .into()
    }

    pub fn remove(current: &Service) -> Self {
        StepKind::Remove {
            service_id: current.service_id,
            current: current.clone(),
        }
        .into()
    }

    pub fn start(current: Option<&Service>, target: &Service) -> Self {
        StepKind::Start {
            service_id: target.service_id,
            current: current.cloned(),
            target: target.clone(),
        }
        .into()
    }

    pub fn stop(current: &Service, target: &Service) -> Self {
        StepKind::Stop {
            service_id: target.service_id,
            current: current.clone(),
            target: Some(target.clone()),
        }
        .into()
    }

    pub fn handover(current: &Service, target: &Service, timeout: Option<u64>) -> Self {
        StepKind::Handover {
            service_id: target.service_id,
            current: current.clone(),
            target: target.clone(),
            timeout,
        }
        .into()
    }

    pub fn update_metadata(current: &Service, target: &Service) -> Self {
        StepKind::UpdateMetadata {
            service_id: target.service_id,
            current: current.clone(),
            target: target.clone(),
        }
        .into()
    }

    /// Download the image of a target service.
    pub fn fetch(target: &Service) -> Self {
        StepKind::Fetch {
            image: Image::for_service(target),
            service_id: target.service_id,
            service_name: target.service_name.clone(),
        }
        .into()
    }
}

/// Drop structural duplicates, keeping the first occurrence.
pub fn dedup(steps: Vec<Step>) -> Vec<Step> {
    steps.into_iter().fold(Vec::new(), |mut unique, step| {
        if !unique.contains(&step) {
            unique.push(step);
        }
        unique
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppId, ReleaseId, ServiceStatus};

    fn service() -> Service {
        Service {
            app_id: AppId(1),
            service_id: ServiceId(2),
            service_name: "main".to_string(),
            release_id: ReleaseId(3),
            image_id: crate::model::ImageId(4),
            image_name: "img".to_string(),
            container_id: Some("c1".to_string()),
            status: ServiceStatus::Running,
            created_at: None,
            config: crate::model::ServiceConfig::default(),
        }
    }

    #[test]
    fn parse_known_and_unknown_actions() {
        assert_eq!(Action::parse("updateMetadata").ok(), Some(Action::UpdateMetadata));
        assert!(matches!(
            Action::parse("reboot"),
            Err(Error::InvalidAction { .. })
        ));
        assert!(Action::parse("dependent").is_err());
    }

    #[test]
    fn locking_actions() {
        assert!(Action::Kill.needs_lock());
        assert!(Action::Handover.needs_lock());
        assert!(!Action::Start.needs_lock());
        assert!(!Action::Fetch.needs_lock());
    }

    #[test]
    fn serializes_with_action_tag_and_app_id() {
        let step = Step::kill(&service()).with_app(AppId(1));
        let json = serde_json::to_value(&step).ok();

        let action = json.as_ref().and_then(|v| v.get("action")).and_then(|v| v.as_str());
        let app_id = json.as_ref().and_then(|v| v.get("appId")).and_then(|v| v.as_u64());
        let name = json
            .as_ref()
            .and_then(|v| v.pointer("/current/serviceName"))
            .and_then(|v| v.as_str());

        assert_eq!(action, Some("kill"));
        assert_eq!(app_id, Some(1));
        assert_eq!(name, Some("main"));
    }

    #[test]
    fn unit_steps_read_back() {
        let parsed: Option<Step> =
            serde_json::from_str(r#"{"action":"ensureSupervisorNetwork"}"#).ok();
        assert_eq!(
            parsed.map(|s| s.action()),
            Some(Action::EnsureSupervisorNetwork)
        );
    }

    #[test]
    fn dedup_keeps_first_of_each() {
        let steps = vec![Step::noop(), Step::kill(&service()), Step::noop()];
        let unique = dedup(steps);
        assert_eq!(unique.len(), 2);
        assert!(unique.first().is_some_and(Step::is_noop));
    }
}
