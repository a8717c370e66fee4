//! Caller-visible notifications.
//!
//! The issuer reports notable junctures (key generated, request submitted,
//! still in progress, signing failed, ...) as [`Event`]s on an
//! [`EventRecorder`]. Events are advisory: recording never fails and never
//! changes the outcome of an issuance.

use crate::request::CertificateRequestDescriptor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Event reasons emitted by the issuer.
pub mod reason {
    /// A new private key was generated.
    pub const GENERATED: &str = "Generated";
    /// A private key could not be generated.
    pub const PRIVATE_KEY_ERROR: &str = "PrivateKeyError";
    /// Building, submitting or fetching the certificate failed.
    pub const ERROR_SIGNING: &str = "ErrorSigning";
    /// The signing request was accepted by the CA.
    pub const REQUESTED: &str = "Requested";
    /// The CA has not finished issuing yet.
    pub const IN_PROGRESS: &str = "InProgress";
    /// The private key could not be encoded.
    pub const ERROR_PRIVATE_KEY: &str = "ErrorPrivateKey";
    /// The certificate and CA bundle were fetched.
    pub const ISSUED: &str = "Issued";
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// The certificate request an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl From<&CertificateRequestDescriptor> for ObjectRef {
    fn from(request: &CertificateRequestDescriptor) -> Self {
        Self {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            uid: request.uid.clone(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A notification about a certificate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub object: ObjectRef,
    pub event_type: EventType,
    /// Machine-readable reason, one of [`reason`].
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        object: ObjectRef,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            object,
            event_type,
            reason: reason.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn normal(
        object: ObjectRef,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(object, EventType::Normal, reason, message)
    }

    pub fn warning(
        object: ObjectRef,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(object, EventType::Warning, reason, message)
    }
}

/// Sink for issuer events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                certificate = %event.object,
                uid = %event.object.uid,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                certificate = %event.object,
                uid = %event.object.uid,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reasons of all events recorded so far, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectRef {
        let request = CertificateRequestDescriptor::new("default", "web", "uid-1", "web-tls");
        ObjectRef::from(&request)
    }

    #[test]
    fn test_memory_recorder_keeps_order() {
        let recorder = MemoryRecorder::new();
        recorder.record(Event::normal(
            object(),
            reason::GENERATED,
            "Generated new private key",
        ));
        recorder.record(Event::warning(
            object(),
            reason::ERROR_SIGNING,
            "Failed to request certificate",
        ));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Normal);
        assert_eq!(events[1].event_type, EventType::Warning);
        assert_eq!(recorder.reasons(), vec!["Generated", "ErrorSigning"]);

        recorder.clear();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = Event::normal(object(), reason::REQUESTED, "Certificate Requested");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["object"]["uid"], "uid-1");
        assert_eq!(json["event_type"], "Normal");
        assert_eq!(json["reason"], "Requested");
    }

    #[test]
    fn test_object_ref_display() {
        assert_eq!(object().to_string(), "default/web");
    }
}
