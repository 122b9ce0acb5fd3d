use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

/// Event types that carry an explicit action slug in their payload.
const EXPLICIT_SUFFIX: &str = ".action_triggered";
const EXPLICIT_EXACT: &str = "action.triggered";

/// Whether an event type belongs to the explicit-invocation family.
pub fn is_explicit_invocation_type(event_type: &str) -> bool {
    event_type == EXPLICIT_EXACT || event_type.ends_with(EXPLICIT_SUFFIX)
}

/// The semantic payload inside a delivery.
///
/// An event is a dotted `event_type` plus a free-form JSON payload. The
/// payload is consumed by template rendering and, for explicit-invocation
/// events, by the slug lookup in the matcher.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Whether this event names the callable to run rather than relying on
    /// automatic triggers.
    pub fn is_explicit_invocation(&self) -> bool {
        is_explicit_invocation_type(&self.event_type)
    }

    /// The requested action slug for explicit invocations.
    ///
    /// `action.slug` is preferred; `data.action_name` is the legacy fallback.
    pub fn action_slug(&self) -> Option<&str> {
        self.payload
            .pointer("/action/slug")
            .and_then(Value::as_str)
            .or_else(|| self.payload.pointer("/data/action_name").and_then(Value::as_str))
    }
}

/// One control-plane-issued unit of work.
///
/// Claimed when the poller receives it; terminal once the reporter posts
/// `completed` or `failed`. After `visibility_deadline` the control plane
/// re-delivers to another agent, so late reports are logged but still sent.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub event: Event,
    pub visibility_deadline: DateTime<Utc>,
}

impl Delivery {
    /// Build a delivery from one entry of the `GET /deliveries` response.
    ///
    /// Each entry is a flat object carrying `delivery_id`, `event_type`, and
    /// the rest of the event payload. The payload keeps the full object so
    /// templates can navigate every field the control plane sent.
    pub fn from_api_event(value: Value, visibility_deadline: DateTime<Utc>) -> Result<Self> {
        let delivery_id = value
            .get("delivery_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidDelivery("missing delivery_id".into()))?
            .to_string();
        let event_type = value
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::InvalidDelivery(format!("delivery {delivery_id} has no event_type"))
            })?
            .to_string();

        Ok(Self {
            delivery_id,
            event: Event::new(event_type, value),
            visibility_deadline,
        })
    }

    /// Whether the control plane has likely already re-issued this delivery.
    pub fn is_past_visibility(&self, now: DateTime<Utc>) -> bool {
        now > self.visibility_deadline
    }
}
