//! Compatibility shim for preloaded single-container apps.
//!
//! Deprecated: only apps provisioned before service ids existed need this,
//! and it will be dropped together with support for them.

use tracing::debug;

use crate::model::{is_truthy, labels, App};

/// Carry the identity of a legacy preloaded container over to its target.
///
/// When both sides hold exactly one service with the same name and the
/// current one is labelled legacy, the target takes over the current
/// service id and legacy labels so the comparator sees an update instead
/// of an install plus a removal. Returns whether the target was changed.
pub fn carry_over_legacy_identity(current: &App, target: &mut App) -> bool {
    let ([current_service], [target_service]) =
        (current.services.as_slice(), target.services.as_mut_slice())
    else {
        return false;
    };

    if target_service.service_name != current_service.service_name
        || !is_truthy(current_service.label(labels::LEGACY_CONTAINER))
    {
        return false;
    }

    debug!(
        service = %current_service.service_name,
        service_id = %current_service.service_id,
        "Carrying over legacy container identity"
    );

    for key in [labels::LEGACY_CONTAINER, labels::SERVICE_ID] {
        match current_service.config.labels.get(key) {
            Some(value) => {
                target_service
                    .config
                    .labels
                    .insert(key.to_string(), value.clone());
            }
            None => {
                target_service.config.labels.remove(key);
            }
        }
    }
    target_service.service_id = current_service.service_id;
    true
}
