//! In-memory transport used by the orchestrator's own test suite. Records
//! every send it was asked to make and lets a test script the reconciliation
//! outcome for a given idempotency token, without touching the network.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::OutboundMessage;
use super::OutlookTransport;
use super::ReconcileMethod;
use super::ReconcileResult;
use super::SendResult;
use crate::domain::MessageIdSource;
use crate::errors::CoreError;

pub struct MockTransport {
    pub sends: Mutex<Vec<OutboundMessage>>,
    pub next_message_id: Mutex<Option<String>>,
    pub fail_next_with: Mutex<Option<String>>,
    pub reconciles: Mutex<HashMap<String, ReconcileResult>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
            next_message_id: Mutex::new(None),
            fail_next_with: Mutex::new(None),
            reconciles: Mutex::new(HashMap::new()),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    pub fn set_next_message_id(&self, id: impl Into<String>) { *self.next_message_id.lock().unwrap() = Some(id.into()); }

    pub fn fail_next(&self, message: impl Into<String>) { *self.fail_next_with.lock().unwrap() = Some(message.into()); }

    pub fn stage_reconcile(&self, token: impl Into<String>, result: ReconcileResult) {
        self.reconciles.lock().unwrap().insert(token.into(), result);
    }

    pub fn send_count(&self) -> usize { self.sends.lock().unwrap().len() }
}

#[async_trait]
impl OutlookTransport for MockTransport {
    async fn send(&self, msg: &OutboundMessage, _idempotency_token: &str) -> Result<SendResult, CoreError> {
        if let Some(err) = self.fail_next_with.lock().unwrap().take() {
            return Err(CoreError::TransportPermanent(err));
        }
        self.sends.lock().unwrap().push(msg.clone());
        let message_id = self.next_message_id.lock().unwrap().take().unwrap_or_else(|| "MID-MOCK".to_string());
        Ok(SendResult {
            success: true,
            email: msg.to.clone(),
            company_name: String::new(),
            message_id,
            is_fallback_id: false,
            message_id_source: MessageIdSource::Direct,
            sent_at: Utc::now(),
            error: None,
        })
    }

    async fn reconcile(
        &self,
        idempotency_token: &str,
        _body_marker: &str,
        _message_id_hint: Option<&str>,
        _subject_norm: &str,
        _recipient: &str,
    ) -> Result<ReconcileResult, CoreError> {
        Ok(self.reconciles.lock().unwrap().remove(idempotency_token).unwrap_or(ReconcileResult {
            matched: false,
            method: None,
            message_id: None,
        }))
    }
}

pub fn matched_header(message_id: impl Into<String>) -> ReconcileResult {
    ReconcileResult { matched: true, method: Some(ReconcileMethod::Header), message_id: Some(message_id.into()) }
}
