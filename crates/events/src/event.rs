//! State-change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::EventId;

/// Something changed the observed or desired device state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// A step finished and its effect is visible in the current state.
    StepCompleted {
        event_id: EventId,
        app_id: Option<u32>,
        action: String,
        timestamp: DateTime<Utc>,
    },
    /// A step failed; the next pass recomputes from fresh state.
    StepFailed {
        event_id: EventId,
        app_id: Option<u32>,
        action: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A new target state was written.
    TargetUpdated {
        event_id: EventId,
        app_ids: Vec<u32>,
        timestamp: DateTime<Utc>,
    },
    /// Optional services were left out of the target because their
    /// contracts are not met on this device.
    OptionalServicesSkipped {
        event_id: EventId,
        services: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Progress of an image download.
    DownloadProgress {
        event_id: EventId,
        image_id: u32,
        percent: u8,
        timestamp: DateTime<Utc>,
    },
}

impl StateEvent {
    /// Create a StepCompleted event.
    pub fn step_completed(app_id: Option<u32>, action: impl Into<String>) -> Self {
        Self::StepCompleted {
            event_id: EventId::new(),
            app_id,
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a StepFailed event.
    pub fn step_failed(
        app_id: Option<u32>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepFailed {
            event_id: EventId::new(),
            app_id,
            action: action.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a TargetUpdated event.
    pub fn target_updated(app_ids: Vec<u32>) -> Self {
        Self::TargetUpdated {
            event_id: EventId::new(),
            app_ids,
            timestamp: Utc::now(),
        }
    }

    /// Create an OptionalServicesSkipped event.
    pub fn optional_services_skipped(services: Vec<String>) -> Self {
        Self::OptionalServicesSkipped {
            event_id: EventId::new(),
            services,
            timestamp: Utc::now(),
        }
    }

    /// Create a DownloadProgress event.
    pub fn download_progress(image_id: u32, percent: u8) -> Self {
        Self::DownloadProgress {
            event_id: EventId::new(),
            image_id,
            percent: percent.min(100),
            timestamp: Utc::now(),
        }
    }

    /// Get the event ID.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::StepCompleted { event_id, .. }
            | Self::StepFailed { event_id, .. }
            | Self::TargetUpdated { event_id, .. }
            | Self::OptionalServicesSkipped { event_id, .. }
            | Self::DownloadProgress { event_id, .. } => *event_id,
        }
    }

    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::TargetUpdated { .. } => "target_updated",
            Self::OptionalServicesSkipped { .. } => "optional_services_skipped",
            Self::DownloadProgress { .. } => "download_progress",
        }
    }

    /// Get the application this event concerns, if any.
    pub fn app_id(&self) -> Option<u32> {
        match self {
            Self::StepCompleted { app_id, .. } | Self::StepFailed { app_id, .. } => *app_id,
            Self::TargetUpdated { .. }
            | Self::OptionalServicesSkipped { .. }
            | Self::DownloadProgress { .. } => None,
        }
    }

    /// Whether the event means the current or target state moved, so a new
    /// reconciliation pass is worth running.
    ///
    /// A failed step left the state as it was and is retried on the next
    /// tick. Skipped services are always followed by a `TargetUpdated`.
    /// Download progress is reporting only.
    pub fn changes_state(&self) -> bool {
        matches!(
            self,
            Self::StepCompleted { .. } | Self::TargetUpdated { .. }
        )
    }

    /// Get the timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StepCompleted { timestamp, .. }
            | Self::StepFailed { timestamp, .. }
            | Self::TargetUpdated { timestamp, .. }
            | Self::OptionalServicesSkipped { timestamp, .. }
            | Self::DownloadProgress { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_completed_carries_app_and_action() {
        let event = StateEvent::step_completed(Some(3), "kill");
        assert_eq!(event.event_type(), "step_completed");
        assert_eq!(event.app_id(), Some(3));
        assert!(event.changes_state());
    }

    #[test]
    fn step_failure_is_not_a_state_change() {
        assert!(!StateEvent::step_failed(Some(3), "kill", "updates locked").changes_state());
        assert!(!StateEvent::optional_services_skipped(vec!["gpu".to_string()]).changes_state());
        assert!(StateEvent::target_updated(vec![3]).changes_state());
    }

    #[test]
    fn download_progress_is_clamped_and_not_a_state_change() {
        let event = StateEvent::download_progress(9, 250);
        assert!(matches!(event, StateEvent::DownloadProgress { percent: 100, .. }));
        assert!(!event.changes_state());
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = StateEvent::target_updated(vec![1, 2]);
        let json = serde_json::to_value(&event).ok();
        let tag = json
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        assert_eq!(tag.as_deref(), Some("target_updated"));
    }
}
