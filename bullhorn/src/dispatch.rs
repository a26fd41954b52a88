//! Batch dispatcher: turns a resolved recipient set into provider sends and
//! per-message lifecycle records.
//!
//! Sends within a batch run concurrently up to a configured in-flight bound;
//! batches run sequentially with a pause in between, which is how the
//! provider's requests-per-second ceiling is respected. Every attempted
//! recipient has its message record persisted before `dispatch` returns, so a
//! delivery callback that races the response always finds its record.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::error::{EngineError, Result};
use crate::provider::SmsProvider;
use crate::store::Store;
use crate::types::{
    AuditAction, CategoryId, DeliveryStatus, DispatchJob, DispatchResult, DispatchUpdate,
    MessageId, MessageRecord, Recipient, RecipientOutcome, RecipientSelection,
};

/// Maximum message body length accepted for dispatch.
pub const MAX_MESSAGE_LEN: usize = 1600;

/// Rate-limit shaping for provider sends. The right numbers are a deployment
/// parameter, not a constant: they depend on the provider account's
/// throughput ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Recipients per batch.
    pub batch_size: usize,
    /// Pause between batches in milliseconds.
    pub batch_delay_ms: u64,
    /// Maximum concurrent in-flight provider requests within a batch.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batch_delay_ms: 1_000,
            max_in_flight: 10,
        }
    }
}

/// The dispatch engine. Stateless across calls: everything lives in the
/// store, and the provider client is injected at construction.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    provider: Arc<dyn SmsProvider>,
    audit: AuditRecorder,
    config: DispatchConfig,
    updates_tx: broadcast::Sender<DispatchUpdate>,
}

impl Dispatcher {
    /// The broadcast channel buffers up to 1024 updates; a subscriber that
    /// falls behind loses the oldest ones.
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn SmsProvider>,
        audit: AuditRecorder,
        config: DispatchConfig,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(1024);
        Self {
            store,
            provider,
            audit,
            config,
            updates_tx,
        }
    }

    /// Subscribe to per-recipient updates emitted as records are written.
    ///
    /// `Some(ids)` filters to specific message IDs; `None` passes everything
    /// through (useful for monitoring).
    pub fn subscribe(
        &self,
        message_ids: Option<Vec<MessageId>>,
    ) -> Pin<Box<dyn Stream<Item = DispatchUpdate> + Send>> {
        let rx = self.updates_tx.subscribe();

        match message_ids {
            Some(ids) => {
                let stream = BroadcastStream::new(rx).filter_map(move |result| {
                    let update = match result {
                        Ok(update) if ids.contains(&update.message_id) => Some(update),
                        _ => None,
                    };
                    async move { update }
                });
                Box::pin(stream)
            }
            None => {
                let stream =
                    BroadcastStream::new(rx).filter_map(|result| async move { result.ok() });
                Box::pin(stream)
            }
        }
    }

    /// Dispatch one message body to a resolved recipient set.
    ///
    /// Partial-failure semantics: a provider rejection for one recipient is
    /// recorded as a `Failed` message and the rest of the batch continues.
    /// Cancelling `cancel` stops scheduling further batches; sends already in
    /// flight complete and record their outcome. Recipients never attempted
    /// are reported in `skipped_count`.
    #[instrument(
        skip_all,
        fields(
            actor = %job.actor.id,
            recipients = recipients.len(),
            selection = %job.selection.describe(),
        )
    )]
    pub async fn dispatch(
        &self,
        job: &DispatchJob,
        recipients: Vec<Recipient>,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult> {
        let body_len = job.body.chars().count();
        if body_len == 0 || body_len > MAX_MESSAGE_LEN {
            return Err(EngineError::InvalidMessage(format!(
                "message body must be 1-{MAX_MESSAGE_LEN} characters, got {body_len}"
            )));
        }

        info!(
            segments = crate::phone::segment_count(&job.body),
            "dispatch accepted"
        );

        let category_id = match &job.selection {
            RecipientSelection::Category { id } => Some(*id),
            _ => None,
        };

        let total = recipients.len();
        let mut outcomes: Vec<RecipientOutcome> = Vec::with_capacity(total);
        let batch_size = self.config.batch_size.max(1);
        let max_in_flight = self.config.max_in_flight.max(1);

        for (index, batch) in recipients.chunks(batch_size).enumerate() {
            if index == 0 {
                if cancel.is_cancelled() {
                    warn!("dispatch cancelled before first batch");
                    break;
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(attempted = outcomes.len(), "dispatch cancelled between batches");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)) => {}
                }
            }

            debug!(batch = index, size = batch.len(), "sending batch");
            let batch_outcomes: Vec<RecipientOutcome> = stream::iter(batch.to_vec())
                .map(|recipient| self.send_one(job, category_id, recipient))
                .buffer_unordered(max_in_flight)
                .collect()
                .await;
            outcomes.extend(batch_outcomes);
        }

        let sent_count = outcomes
            .iter()
            .filter(|o| o.status == DeliveryStatus::Sent)
            .count() as u32;
        let failed_count = outcomes.len() as u32 - sent_count;
        let skipped_count = (total - outcomes.len()) as u32;

        let mut details = format!(
            "Dispatched to {}: {sent_count} sent, {failed_count} failed",
            job.selection.describe()
        );
        if skipped_count > 0 {
            details.push_str(&format!(", {skipped_count} skipped (cancelled)"));
        }
        self.audit
            .record(job.actor, AuditAction::SendSms, Some(details), &job.meta)
            .await;

        info!(sent_count, failed_count, skipped_count, "dispatch finished");
        Ok(DispatchResult {
            sent_count,
            failed_count,
            skipped_count,
            outcomes,
        })
    }

    /// Send to one recipient and persist its message record.
    async fn send_one(
        &self,
        job: &DispatchJob,
        category_id: Option<CategoryId>,
        recipient: Recipient,
    ) -> RecipientOutcome {
        let message_id = Uuid::new_v4();
        let sent_at = Utc::now();

        let (mut status, provider_message_id, mut error_message) =
            match self.provider.send(&recipient.phone_number, &job.body).await {
                Ok(sid) => (DeliveryStatus::Sent, Some(sid), None),
                Err(e) => {
                    warn!(recipient = %recipient.phone_number, error = %e, "provider send failed");
                    (DeliveryStatus::Failed, None, Some(e.to_string()))
                }
            };

        let record = MessageRecord {
            id: message_id,
            sent_by: job.actor.id,
            recipient: recipient.phone_number.clone(),
            body: job.body.clone(),
            status,
            category_id,
            provider_message_id: provider_message_id.clone(),
            sent_at,
            delivered_at: None,
            failed_at: (status == DeliveryStatus::Failed).then_some(sent_at),
            error_message: error_message.clone(),
        };

        if let Err(e) = self.store.insert_message(record).await {
            // The send may already be on its way; surface the record loss in
            // the outcome rather than pretending the recipient succeeded.
            error!(message_id = %message_id, error = %e, "failed to persist message record");
            status = DeliveryStatus::Failed;
            error_message = Some(format!("message record not persisted: {e}"));
        }

        let _ = self.updates_tx.send(DispatchUpdate {
            message_id,
            recipient: recipient.phone_number.clone(),
            status,
        });

        RecipientOutcome {
            contact_id: recipient.contact_id,
            recipient: recipient.phone_number,
            message_id,
            status,
            provider_message_id,
            error: error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::{normalize, E164};
    use crate::provider::{MockSmsProvider, ProviderError};
    use crate::store::memory::InMemoryStore;
    use crate::types::{Actor, RequestMeta, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_job(body: &str) -> DispatchJob {
        DispatchJob {
            actor: Actor {
                id: Uuid::new_v4(),
                role: Role::Admin,
            },
            body: body.to_string(),
            selection: RecipientSelection::All,
            meta: RequestMeta::default(),
        }
    }

    fn recipients(numbers: &[&str]) -> Vec<Recipient> {
        numbers
            .iter()
            .map(|n| Recipient {
                contact_id: Uuid::new_v4(),
                phone_number: normalize(n).unwrap(),
            })
            .collect()
    }

    fn dispatcher_with(
        store: Arc<InMemoryStore>,
        provider: Arc<dyn SmsProvider>,
        config: DispatchConfig,
    ) -> Dispatcher {
        let audit = AuditRecorder::new(store.clone());
        Dispatcher::new(store, provider, audit, config)
    }

    #[tokio::test]
    async fn creates_one_record_per_recipient() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store.clone(), provider.clone(), DispatchConfig::default());

        let targets = recipients(&["5551230000", "5551230001", "5551230002"]);
        let result = dispatcher
            .dispatch(&test_job("hello"), targets, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.sent_count, 3);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.skipped_count, 0);
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(provider.call_count(), 3);

        // Every outcome's record is queryable by its provider id.
        for outcome in &result.outcomes {
            let sid = outcome.provider_message_id.as_deref().unwrap();
            let record = store.find_message_by_provider_id(sid).await.unwrap();
            assert_eq!(record.status, DeliveryStatus::Sent);
            assert_eq!(record.body, "hello");
        }
    }

    #[tokio::test]
    async fn one_rejected_number_does_not_abort_the_batch() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        provider.fail_number("+15551230001", "not a valid number");
        let dispatcher = dispatcher_with(store.clone(), provider.clone(), DispatchConfig::default());

        let targets = recipients(&["5551230000", "5551230001", "5551230002"]);
        let result = dispatcher
            .dispatch(&test_job("hello"), targets, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.sent_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.sent_count + result.failed_count, 3);

        let failed = result
            .outcomes
            .iter()
            .find(|o| o.status == DeliveryStatus::Failed)
            .unwrap();
        assert_eq!(failed.recipient.as_str(), "+15551230001");
        assert!(failed.error.as_deref().unwrap().contains("not a valid"));

        let record = store.get_message(failed.message_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(record.failed_at.is_some());
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn zero_recipients_is_not_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store.clone(), provider.clone(), DispatchConfig::default());

        let result = dispatcher
            .dispatch(&test_job("hello"), Vec::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.sent_count, 0);
        assert_eq!(result.failed_count, 0);
        assert!(result.outcomes.is_empty());
        assert_eq!(provider.call_count(), 0);
        // The dispatch is still audited.
        assert_eq!(store.list_activity().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_bodies_before_any_side_effect() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store.clone(), provider.clone(), DispatchConfig::default());
        let targets = recipients(&["5551230000"]);

        let too_long = "a".repeat(1601);
        for body in ["", too_long.as_str()] {
            let err = dispatcher
                .dispatch(&test_job(body), targets.clone(), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidMessage(_)));
        }
        assert_eq!(provider.call_count(), 0);
        assert!(store.list_activity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_of_exactly_1600_chars_is_accepted() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store.clone(), provider, DispatchConfig::default());

        let result = dispatcher
            .dispatch(
                &test_job(&"a".repeat(1600)),
                recipients(&["5551230000"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.sent_count, 1);
    }

    #[tokio::test]
    async fn pre_cancelled_dispatch_attempts_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store.clone(), provider.clone(), DispatchConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher
            .dispatch(
                &test_job("hello"),
                recipients(&["5551230000", "5551230001"]),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(result.sent_count, 0);
        assert_eq!(result.skipped_count, 2);
        assert_eq!(provider.call_count(), 0);
    }

    /// Provider wrapper that cancels the dispatch token on its first send,
    /// simulating an operator stop while the first batch is in flight.
    struct CancellingProvider {
        inner: MockSmsProvider,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl SmsProvider for CancellingProvider {
        async fn send(&self, to: &E164, body: &str) -> std::result::Result<String, ProviderError> {
            self.cancel.cancel();
            self.inner.send(to, body).await
        }
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_batch_finish_and_skips_the_rest() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        let provider = Arc::new(CancellingProvider {
            inner: MockSmsProvider::new(),
            cancel: cancel.clone(),
        });
        let config = DispatchConfig {
            batch_size: 2,
            batch_delay_ms: 5_000,
            max_in_flight: 2,
        };
        let dispatcher = dispatcher_with(store.clone(), provider, config);

        let targets = recipients(&["5551230000", "5551230001", "5551230002", "5551230003"]);
        let result = dispatcher
            .dispatch(&test_job("hello"), targets, &cancel)
            .await
            .unwrap();

        // First batch completed and recorded; second batch never scheduled.
        assert_eq!(result.sent_count, 2);
        assert_eq!(result.skipped_count, 2);
        assert_eq!(result.outcomes.len(), 2);
        for outcome in &result.outcomes {
            store.get_message(outcome.message_id).await.unwrap();
        }
    }

    /// Provider that tracks its maximum observed concurrency.
    struct ConcurrencyProbe {
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SmsProvider for ConcurrencyProbe {
        async fn send(
            &self,
            _to: &E164,
            _body: &str,
        ) -> std::result::Result<String, ProviderError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("SM{}", Uuid::new_v4().simple()))
        }
    }

    #[tokio::test]
    async fn in_flight_sends_are_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let config = DispatchConfig {
            batch_size: 20,
            batch_delay_ms: 0,
            max_in_flight: 4,
        };
        let dispatcher = dispatcher_with(store, probe.clone(), config);

        let numbers: Vec<String> = (0..20).map(|i| format!("55512300{i:02}")).collect();
        let refs: Vec<&str> = numbers.iter().map(String::as_str).collect();
        let result = dispatcher
            .dispatch(&test_job("hello"), recipients(&refs), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.sent_count, 20);
        assert!(probe.max_seen.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn subscribers_see_per_recipient_updates() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockSmsProvider::new());
        let dispatcher = dispatcher_with(store, provider, DispatchConfig::default());

        let mut updates = dispatcher.subscribe(None);
        let result = dispatcher
            .dispatch(
                &test_job("hello"),
                recipients(&["5551230000", "5551230001"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let update = tokio::time::timeout(Duration::from_secs(1), updates.next())
                .await
                .expect("update within timeout")
                .expect("stream open");
            seen.push(update);
        }
        for outcome in &result.outcomes {
            assert!(seen.iter().any(|u| u.message_id == outcome.message_id));
        }
    }
}
