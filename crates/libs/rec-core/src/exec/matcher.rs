//! Event-to-action matching.

use std::sync::Arc;

use crate::model::action::Action;
use crate::model::catalog::ActionCatalog;
use crate::model::delivery::Event;

/// Actions to run for an event.
///
/// Explicit-invocation events (`*.action_triggered`, `action.triggered`)
/// select among callable actions by slug: `event.action.slug` first,
/// `event.data.action_name` as fallback; no slug or no match yields an empty
/// set. Any other event selects every action whose trigger equals the event
/// type.
pub fn matching_actions(catalog: &ActionCatalog, event: &Event) -> Vec<Arc<Action>> {
    if event.is_explicit_invocation() {
        let Some(slug) = event.action_slug() else {
            return Vec::new();
        };
        return catalog
            .callable()
            .filter(|action| action.id == slug)
            .cloned()
            .collect();
    }

    catalog
        .actions()
        .iter()
        .filter(|action| action.trigger_event_type == event.event_type)
        .cloned()
        .collect()
}
