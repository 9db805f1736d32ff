use chrono::Utc;

use crate::crd::microservice::{ConditionType, MicroServiceStatus, ResourceRef};

/// Status the resource should carry after a pass. The transition time only
/// moves when the condition itself changes.
pub fn desired_status(
    current: Option<&MicroServiceStatus>,
    condition: ConditionType,
    message: impl Into<String>,
    generation: Option<i64>,
    resources: Vec<ResourceRef>,
) -> MicroServiceStatus {
    let last_transition_time = current
        .filter(|s| s.condition == Some(condition))
        .and_then(|s| s.last_transition_time.clone())
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    MicroServiceStatus {
        condition: Some(condition),
        message: Some(message.into()),
        observed_generation: generation,
        last_transition_time: Some(last_transition_time),
        resources,
    }
}

/// Whether writing `desired` would change anything a reader cares about.
pub fn should_patch_status(
    current: Option<&MicroServiceStatus>,
    desired: &MicroServiceStatus,
) -> bool {
    let Some(current) = current else {
        return true;
    };
    current.condition != desired.condition
        || current.message != desired.message
        || current.observed_generation != desired.observed_generation
        || current.resources != desired.resources
}
