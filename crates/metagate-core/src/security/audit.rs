//! Audit logging for security events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::context::CallerContext;
use crate::catalog::Verb;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

fn generate_event_id(timestamp: u64) -> [u8; 16] {
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&timestamp.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    id
}

/// Types of audit events.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEventType {
    /// A verb was refused.
    AccessDenied {
        /// Target object.
        object: String,
        /// Refused verb.
        verb: Verb,
        /// Reason for denial.
        reason: String,
    },
    /// Row filters were merged into a query.
    RlsApplied {
        /// Target object.
        object: String,
        /// Number of predicates merged.
        predicates: usize,
    },
    /// Fields were masked in a result.
    FieldsMasked {
        /// Target object.
        object: String,
        /// Masked field names.
        fields: Vec<String>,
    },
    /// A formula or placeholder could not be evaluated; access was refused.
    FormulaFault {
        /// Target object.
        object: String,
        /// Failure description.
        reason: String,
    },
    /// A hook failed.
    HookFailed {
        /// Hook name.
        hook: String,
        /// Concrete event.
        event: String,
        /// Failure description.
        reason: String,
    },
}

/// An audit event with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: [u8; 16],
    /// Microseconds since Unix epoch.
    pub timestamp: u64,
    /// Caller user id.
    pub user_id: Option<String>,
    /// Caller role.
    pub role: Option<String>,
    /// Request id.
    pub request_id: Option<String>,
    /// Event details.
    pub event_type: AuditEventType,
}

impl AuditEvent {
    /// Create an event for a caller.
    pub fn new(caller: &CallerContext, event_type: AuditEventType) -> Self {
        let timestamp = current_timestamp();
        Self {
            id: generate_event_id(timestamp),
            timestamp,
            user_id: caller.user_id.clone(),
            role: caller.role.clone(),
            request_id: caller.request_id.clone(),
            event_type,
        }
    }

    /// Access denied event.
    pub fn access_denied(
        caller: &CallerContext,
        object: impl Into<String>,
        verb: Verb,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            caller,
            AuditEventType::AccessDenied {
                object: object.into(),
                verb,
                reason: reason.into(),
            },
        )
    }

    /// Row filter event.
    pub fn rls_applied(caller: &CallerContext, object: impl Into<String>, predicates: usize) -> Self {
        Self::new(
            caller,
            AuditEventType::RlsApplied {
                object: object.into(),
                predicates,
            },
        )
    }

    /// Masking event.
    pub fn fields_masked(caller: &CallerContext, object: impl Into<String>, fields: Vec<String>) -> Self {
        Self::new(
            caller,
            AuditEventType::FieldsMasked {
                object: object.into(),
                fields,
            },
        )
    }

    /// Formula fault event.
    pub fn formula_fault(caller: &CallerContext, object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            caller,
            AuditEventType::FormulaFault {
                object: object.into(),
                reason: reason.into(),
            },
        )
    }

    /// Hook failure event.
    pub fn hook_failed(
        caller: &CallerContext,
        hook: impl Into<String>,
        event: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            caller,
            AuditEventType::HookFailed {
                hook: hook.into(),
                event: event.into(),
                reason: reason.into(),
            },
        )
    }

    /// Format as a single log line.
    pub fn to_log_line(&self) -> String {
        let detail = match &self.event_type {
            AuditEventType::AccessDenied {
                object,
                verb,
                reason,
            } => format!("ACCESS_DENIED object={} verb={} reason={}", object, verb, reason),
            AuditEventType::RlsApplied { object, predicates } => {
                format!("RLS_APPLIED object={} predicates={}", object, predicates)
            }
            AuditEventType::FieldsMasked { object, fields } => {
                format!("FIELDS_MASKED object={} fields=[{}]", object, fields.join(","))
            }
            AuditEventType::FormulaFault { object, reason } => {
                format!("FORMULA_FAULT object={} reason={}", object, reason)
            }
            AuditEventType::HookFailed {
                hook,
                event,
                reason,
            } => format!("HOOK_FAILED hook={} event={} reason={}", hook, event, reason),
        };

        format!(
            "{} id={} user={} role={} {}",
            self.timestamp,
            hex::encode(self.id),
            self.user_id.as_deref().unwrap_or("-"),
            self.role.as_deref().unwrap_or("-"),
            detail
        )
    }
}

/// Sink for audit events.
pub trait AuditLogger: Send + Sync {
    /// Record an event.
    fn log(&self, event: AuditEvent);
}

/// Emits audit events as `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        match &event.event_type {
            AuditEventType::AccessDenied { .. } | AuditEventType::FormulaFault { .. } => {
                tracing::warn!(target: "audit", "{}", event.to_log_line());
            }
            AuditEventType::HookFailed { .. } => {
                tracing::error!(target: "audit", "{}", event.to_log_line());
            }
            AuditEventType::RlsApplied { .. } | AuditEventType::FieldsMasked { .. } => {
                tracing::debug!(target: "audit", "{}", event.to_log_line());
            }
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
