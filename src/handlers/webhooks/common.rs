//! Common webhook handling infrastructure for payment providers.
//!
//! Every delivery runs the same pipeline: verify the signature, claim the
//! idempotency key, classify, settle. Nothing before settlement touches
//! business tables, and every delivery leaves a `webhook_events` row.

use axum::http::{HeaderMap, StatusCode};
use rusqlite::Connection;

use crate::config::SignaturePolicy;
use crate::db::{AppState, queries};
use crate::error::{AppError, msg};
use crate::models::{ClaimOutcome, NewWebhookEvent, PaymentProvider};
use crate::settlement::{self, ClassifyError, ParsedDelivery, SettlementError, SettlementOutcome};

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

const UNPARSEABLE_EVENT_TYPE: &str = "unparseable";
const INVALID_SIGNATURE_ERROR: &str = "invalid signature";

/// Trait for payment provider webhook handling.
///
/// Implementors supply signature checks and payload classification; the
/// pipeline in this module does the rest.
pub trait WebhookProvider: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    /// Extract the signature from request headers, if present.
    fn extract_signature(&self, headers: &HeaderMap) -> Option<String>;

    fn verify_signature(&self, body: &[u8], signature: &str) -> bool;

    /// Parse the raw body. Fails only when the body cannot be read at all;
    /// classification problems are carried in `ParsedDelivery::event`.
    fn parse_delivery(&self, body: &[u8]) -> Result<ParsedDelivery, ClassifyError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub signature_policy: SignaturePolicy,
    pub claim_timeout_secs: i64,
}

impl From<&AppState> for PipelineOptions {
    fn from(state: &AppState) -> Self {
        Self {
            signature_policy: state.signature_policy,
            claim_timeout_secs: state.webhook_claim_timeout_secs,
        }
    }
}

#[derive(Debug)]
pub enum WebhookOutcome {
    Settled(SettlementOutcome),
    /// Same idempotency key already settled or in flight.
    Duplicate { original_id: String },
    SignatureRejected,
    /// Delivery could not be classified; recorded and acknowledged.
    InputError(ClassifyError),
    Failed(SettlementError),
}

impl WebhookOutcome {
    pub fn response(&self) -> WebhookResult {
        match self {
            WebhookOutcome::Settled(_) => (StatusCode::OK, msg::OK),
            WebhookOutcome::Duplicate { .. } => (StatusCode::OK, msg::ALREADY_PROCESSED),
            WebhookOutcome::InputError(_) | WebhookOutcome::Failed(SettlementError::Input(_)) => {
                (StatusCode::OK, msg::EVENT_NOT_PROCESSABLE)
            }
            WebhookOutcome::SignatureRejected => (StatusCode::UNAUTHORIZED, msg::INVALID_SIGNATURE),
            // Non-2xx so the provider redelivers once the missing data exists
            WebhookOutcome::Failed(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.public_message()),
        }
    }
}

/// Run one delivery through the pipeline.
///
/// Storage errors while recording the delivery itself are returned as `Err`;
/// everything else is an outcome.
pub fn process_webhook<P: WebhookProvider + ?Sized>(
    provider: &P,
    conn: &mut Connection,
    options: PipelineOptions,
    body: &[u8],
    signature: Option<&str>,
) -> Result<WebhookOutcome, AppError> {
    let provider_id = provider.provider();
    let provider_name = provider_id.as_ref();
    let signature_ok = provider.verify_signature(body, signature.unwrap_or_default());
    let parsed = provider.parse_delivery(body);

    let record = NewWebhookEvent {
        provider: provider_id,
        event_type: parsed
            .as_ref()
            .map(|d| d.event_type.clone())
            .unwrap_or_else(|_| UNPARSEABLE_EVENT_TYPE.to_string()),
        idempotency_key: parsed.as_ref().ok().and_then(|d| d.idempotency_key.clone()),
        raw_payload: String::from_utf8_lossy(body).into_owned(),
        signature_ok,
    };

    if !signature_ok {
        match options.signature_policy {
            SignaturePolicy::Reject => {
                tracing::warn!(
                    "{} webhook rejected: invalid signature (type={}, key={:?})",
                    provider_name,
                    record.event_type,
                    record.idempotency_key
                );
                // Recorded without a claim so a forged delivery cannot take the key
                queries::record_webhook_event(conn, &record, Some(INVALID_SIGNATURE_ERROR))?;
                return Ok(WebhookOutcome::SignatureRejected);
            }
            SignaturePolicy::Flag => tracing::warn!(
                "{} webhook has an invalid signature, processing anyway",
                provider_name
            ),
        }
    }

    let delivery = match parsed {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("{} webhook payload unreadable: {}", provider_name, e);
            queries::record_webhook_event(conn, &record, Some(&e.to_string()))?;
            return Ok(WebhookOutcome::InputError(e));
        }
    };

    if record.idempotency_key.is_none() {
        let error = match &delivery.event {
            Err(e) => e.clone(),
            Ok(_) => ClassifyError::MissingField("idempotency key"),
        };
        tracing::warn!("{} webhook without idempotency key: {}", provider_name, error);
        queries::record_webhook_event(conn, &record, Some(&error.to_string()))?;
        return Ok(WebhookOutcome::InputError(error));
    }

    let stale_before = queries::now() - options.claim_timeout_secs;
    let event_id = match queries::try_claim_webhook_event(conn, &record, stale_before)? {
        ClaimOutcome::Claimed { event_id } => event_id,
        ClaimOutcome::Reclaimed { event_id, attempts } => {
            tracing::info!(
                "{} webhook {:?} retried (attempt {})",
                provider_name,
                record.idempotency_key,
                attempts
            );
            event_id
        }
        ClaimOutcome::Duplicate { original_id, .. } => {
            tracing::info!(
                "{} webhook {:?} already processed (claim {})",
                provider_name,
                record.idempotency_key,
                original_id
            );
            return Ok(WebhookOutcome::Duplicate { original_id });
        }
    };

    let event = match delivery.event {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("{} webhook {} not classifiable: {}", provider_name, event_id, e);
            queries::mark_webhook_failed(conn, &event_id, &e.to_string())?;
            return Ok(WebhookOutcome::InputError(e));
        }
    };

    match settlement::settle(conn, &event_id, provider_id, &event) {
        Ok(outcome) => Ok(WebhookOutcome::Settled(outcome)),
        Err(e) => {
            match &e {
                SettlementError::Storage(inner) => {
                    tracing::error!("{} {} settlement failed: {}", provider_name, event.kind(), inner)
                }
                other => tracing::warn!(
                    "{} {} settlement failed: {}",
                    provider_name,
                    event.kind(),
                    other
                ),
            }
            queries::mark_webhook_failed(conn, &event_id, &e.to_string())?;
            Ok(WebhookOutcome::Failed(e))
        }
    }
}

/// Run a delivery against the shared pool and map the outcome to a response.
pub fn handle_webhook<P: WebhookProvider + ?Sized>(
    provider: &P,
    state: &AppState,
    body: &[u8],
    signature: Option<&str>,
) -> WebhookResult {
    let mut conn = match state.db.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("DB connection error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, msg::DATABASE_ERROR);
        }
    };

    match process_webhook(provider, &mut conn, state.into(), body, signature) {
        Ok(outcome) => outcome.response(),
        Err(e) => {
            tracing::error!("{} webhook failed: {}", provider.provider().as_ref(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, msg::DATABASE_ERROR)
        }
    }
}
