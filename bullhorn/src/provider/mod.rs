//! SMS transport provider abstraction.
//!
//! The provider is a black box: one send request in, one provider message ID
//! out, and asynchronous delivery-status events later via webhook. The trait
//! keeps the dispatcher testable without real provider traffic.

use async_trait::async_trait;
use thiserror::Error;

use crate::phone::E164;

pub mod http;

pub use http::{HttpSmsProvider, ProviderConfig};

/// Errors from a synchronous provider send attempt. Either way the message
/// record ends up `Failed` with this as the error detail; the distinction
/// only matters for logging.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider understood the request and refused it (bad number,
    /// quota exceeded, ...).
    #[error("provider rejected send: {0}")]
    Rejected(String),

    /// The request never got a usable answer (network failure, timeout,
    /// malformed response).
    #[error("provider request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Request one message send. Returns the provider-assigned message ID on
    /// acceptance; delivery itself is reported later through the webhook.
    async fn send(&self, to: &E164, body: &str) -> Result<String, ProviderError>;
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;

/// Record of a call made to the mock provider.
#[derive(Debug, Clone)]
pub struct MockSendCall {
    pub to: String,
    pub body: String,
}

/// Mock provider for tests.
///
/// Unscripted destinations succeed with a generated message ID. Specific
/// destinations can be scripted with queued responses, returned in FIFO
/// order.
#[derive(Default)]
pub struct MockSmsProvider {
    responses: Mutex<HashMap<String, Vec<Result<String, ProviderError>>>>,
    calls: Mutex<Vec<MockSendCall>>,
}

impl MockSmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a destination number.
    pub fn add_response(&self, to: &str, response: Result<String, ProviderError>) {
        self.responses
            .lock()
            .entry(to.to_string())
            .or_default()
            .push(response);
    }

    /// Script a rejection for a destination number.
    pub fn fail_number(&self, to: &str, reason: &str) {
        self.add_response(to, Err(ProviderError::Rejected(reason.to_string())));
    }

    pub fn calls(&self) -> Vec<MockSendCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SmsProvider for MockSmsProvider {
    async fn send(&self, to: &E164, body: &str) -> Result<String, ProviderError> {
        self.calls.lock().push(MockSendCall {
            to: to.as_str().to_string(),
            body: body.to_string(),
        });

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(to.as_str()) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Ok(format!("SM{}", uuid::Uuid::new_v4().simple()))
    }
}
