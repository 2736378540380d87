use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A record of an admin-initiated mutation.
///
/// Harvester only emits these; storage belongs to whatever sink is plugged in.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub entity: &'static str,
    pub entity_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: &str,
        action: impl Into<String>,
        entity: &'static str,
        entity_id: impl ToString,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.into(),
            entity,
            entity_id: entity_id.to_string(),
            before: None,
            after: None,
            at,
        }
    }

    pub fn before<T: Serialize>(mut self, value: &T) -> Self {
        self.before = serde_json::to_value(value).ok();
        self
    }

    pub fn after<T: Serialize>(mut self, value: &T) -> Self {
        self.after = serde_json::to_value(value).ok();
        self
    }
}

/// Receives audit events.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Sink that writes audit events to the `harvester::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "harvester::audit",
            actor = %event.actor,
            action = %event.action,
            entity = event.entity,
            entity_id = %event.entity_id,
            "Audit event"
        );
    }
}

pub fn tracing_audit_sink() -> SharedAuditSink {
    Arc::new(TracingAuditSink)
}
