//! Delivery-callback reconciliation.
//!
//! Providers push delivery status asynchronously, possibly duplicated and out
//! of order. The reconciler folds those events into message records under two
//! rules: terminal statuses never regress, and re-applying the same event is
//! a no-op. Ordering problems are resolved here so every store implementation
//! only has to guard the terminal-overwrite race.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{EngineError, Result};
use crate::store::{Store, StoreError};
use crate::types::{DeliveryCallback, DeliveryStatus, MessageRecord};

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one delivery callback and return the record as stored afterwards.
    ///
    /// Callbacks for unknown provider message IDs fail with
    /// [`EngineError::UnknownMessageReference`]; callbacks that would repeat
    /// the current status or regress a terminal one succeed without changing
    /// anything.
    #[instrument(
        skip_all,
        fields(provider_message_id = %callback.provider_message_id, status = ?callback.status)
    )]
    pub async fn apply(&self, callback: &DeliveryCallback) -> Result<MessageRecord> {
        let record = match self
            .store
            .find_message_by_provider_id(&callback.provider_message_id)
            .await
        {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                return Err(EngineError::UnknownMessageReference(
                    callback.provider_message_id.clone(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let next: DeliveryStatus = callback.status.into();

        if record.status == next {
            debug!("callback repeats current status, no-op");
            return Ok(record);
        }
        if !record.status.can_transition_to(next) {
            warn!(
                current = %record.status,
                next = %next,
                message_id = %record.id,
                "out-of-order callback ignored"
            );
            return Ok(record);
        }

        let mut updated = record.clone();
        updated.status = next;
        match next {
            DeliveryStatus::Delivered => {
                updated.delivered_at = Some(callback.timestamp);
            }
            DeliveryStatus::Failed | DeliveryStatus::Bounced => {
                updated.failed_at = Some(callback.timestamp);
                if let Some(detail) = &callback.error_detail {
                    updated.error_message = Some(detail.clone());
                }
            }
            DeliveryStatus::Pending | DeliveryStatus::Sent => {}
        }

        match self.store.persist_message(&updated).await {
            Ok(()) => {
                debug!(message_id = %updated.id, from = %record.status, to = %next, "status reconciled");
                Ok(updated)
            }
            // A concurrent callback reached a terminal status first; report
            // what actually won.
            Err(StoreError::TerminalStatus) => {
                warn!(message_id = %record.id, "record went terminal concurrently");
                Ok(self.store.get_message(record.id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}
