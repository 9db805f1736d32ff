use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::debug;

use super::dependent::{Change, Verb};
use super::reconcile::Outcome;
use crate::crd::microservice::MicroService;

pub const REASON_CREATED: &str = "Created";
pub const REASON_UPDATED: &str = "Updated";
pub const REASON_DELETED: &str = "Deleted";
pub const REASON_FAILED: &str = "ReconcileFailed";

/// Normal event describing one applied change, if it was a mutation.
pub fn change_event(change: &Change) -> Option<Event> {
    let (reason, action) = match change.verb {
        Verb::Created => (REASON_CREATED, "Create"),
        Verb::Updated => (REASON_UPDATED, "Update"),
        Verb::Deleted => (REASON_DELETED, "Delete"),
        Verb::Unchanged => return None,
    };
    Some(Event {
        type_: EventType::Normal,
        reason: reason.into(),
        note: Some(format!(
            "{} {} {}",
            change.kind,
            change.name,
            reason.to_lowercase()
        )),
        action: action.into(),
        secondary: None,
    })
}

/// Every event an outcome should produce, in publish order.
pub fn outcome_events(outcome: &Outcome) -> Vec<Event> {
    let mut events: Vec<Event> = outcome
        .changes()
        .into_iter()
        .filter_map(change_event)
        .collect();
    if let Outcome::Failed(err) = outcome {
        events.push(Event {
            type_: EventType::Warning,
            reason: REASON_FAILED.into(),
            note: Some(err.to_string()),
            action: "Reconcile".into(),
            secondary: None,
        });
    }
    events
}

pub async fn publish_outcome(
    recorder: &Recorder,
    obj: &MicroService,
    outcome: &Outcome,
) {
    let reference = obj.object_ref(&());
    for event in outcome_events(outcome) {
        if let Err(e) = recorder.publish(&event, &reference).await {
            debug!(error = %e, reason = %event.reason, "event publish failed");
        }
    }
}
