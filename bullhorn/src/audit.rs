//! Activity log recorder.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::store::Store;
use crate::types::{ActivityLogEntry, Actor, AuditAction, RequestMeta};

/// Records one activity log entry per mutating operation.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn Store>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append one entry. The write completes before the caller's request is
    /// considered handled; if it fails, the failure is logged at error level
    /// rather than rolling back the operation that already happened.
    pub async fn record(
        &self,
        actor: Actor,
        action: AuditAction,
        details: Option<String>,
        meta: &RequestMeta,
    ) {
        let entry = ActivityLogEntry {
            id: Uuid::new_v4(),
            user_id: actor.id,
            action,
            details,
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.append_activity(entry).await {
            tracing::error!(
                user_id = %actor.id,
                action = %action,
                error = %e,
                "failed to append activity log entry"
            );
        }
    }
}
