//! Event model for the usage telemetry pipeline.
//!
//! Defines the taxonomy of recordable events, the wire representation sent to
//! the collector, and the one-way derivation used for anonymized user
//! identifiers. Field names serialize in camelCase to match the collector's
//! ingest contract and the persisted buffer document.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kinds of usage events the recorder accepts.
///
/// The wire representation is the snake_case tag, e.g. `app_created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    AppCreated,
    AppOpened,
    AppDeleted,
    PageView,
    UiInteraction,
    LanguageChanged,
    Error,
    /// Internal diagnostic marker for failed collector deliveries. Reserved:
    /// the recorder refuses it so delivery failures can never re-enter the
    /// queue they failed to leave.
    DeliveryFailure,
}

impl EventType {
    /// Returns all event types, including non-reportable ones.
    pub fn all() -> &'static [EventType] {
        &[
            EventType::SessionStart,
            EventType::SessionEnd,
            EventType::AppCreated,
            EventType::AppOpened,
            EventType::AppDeleted,
            EventType::PageView,
            EventType::UiInteraction,
            EventType::LanguageChanged,
            EventType::Error,
            EventType::DeliveryFailure,
        ]
    }

    /// Returns the string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::AppCreated => "app_created",
            EventType::AppOpened => "app_opened",
            EventType::AppDeleted => "app_deleted",
            EventType::PageView => "page_view",
            EventType::UiInteraction => "ui_interaction",
            EventType::LanguageChanged => "language_changed",
            EventType::Error => "error",
            EventType::DeliveryFailure => "delivery_failure",
        }
    }

    /// Returns the broad category this event type belongs to.
    pub fn category(&self) -> EventCategory {
        match self {
            EventType::SessionStart | EventType::SessionEnd => EventCategory::Session,
            EventType::AppCreated | EventType::AppOpened | EventType::AppDeleted => {
                EventCategory::App
            }
            EventType::PageView | EventType::UiInteraction => EventCategory::Ui,
            EventType::LanguageChanged => EventCategory::Context,
            EventType::Error => EventCategory::Error,
            EventType::DeliveryFailure => EventCategory::Diagnostic,
        }
    }

    /// Whether the recorder accepts this event type from callers.
    ///
    /// Diagnostic types describe the pipeline's own delivery problems and are
    /// rejected at the recording boundary.
    pub fn is_reportable(&self) -> bool {
        self.category() != EventCategory::Diagnostic
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broad grouping of event types, used for reporting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Session,
    App,
    Ui,
    Context,
    Error,
    Diagnostic,
}

/// Free-form descriptive payload attached to an event.
///
/// Values must already be anonymized by the caller; the pipeline never
/// inspects or scrubs them.
pub type EventDetails = HashMap<String, serde_json::Value>;

/// A single recorded usage event.
///
/// This is both the wire format posted to the collector and the shape stored
/// in the durable buffer document, so field names are fixed in camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// What happened, as a snake_case tag.
    pub event_type: EventType,
    /// Identifier of the process-lifetime session this event belongs to.
    pub session_id: String,
    /// Anonymized user identifier, absent for signed-out usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Active interface language at the time of recording.
    pub language: String,
    /// Wall-clock time assigned by the recorder.
    pub timestamp: DateTime<Utc>,
    /// Event-specific descriptive fields.
    #[serde(default)]
    pub details: EventDetails,
}

impl Event {
    /// Creates a new event stamped with the current time.
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        user_id: Option<String>,
        language: impl Into<String>,
        details: EventDetails,
    ) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            user_id,
            language: language.into(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Request envelope posted to the collector: `{"events": [...]}`.
#[derive(Debug, Serialize)]
pub(crate) struct EventsBody<'a> {
    pub events: &'a [Event],
}

/// Derives a stable anonymized user identifier from an account identifier.
///
/// The derivation is one-way: a SHA-256 digest truncated to its first 16
/// bytes and hex encoded, yielding a 32 character string. The raw account
/// identifier never leaves the process.
///
/// # Example
///
/// ```
/// use telemetry_relay::event::anonymize_user_id;
///
/// let id = anonymize_user_id("account-1234");
/// assert_eq!(id.len(), 32);
/// assert_ne!(id, "account-1234");
/// ```
pub fn anonymize_user_id(account_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
