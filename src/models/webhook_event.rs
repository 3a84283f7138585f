use serde::{Deserialize, Serialize};

use super::PaymentProvider;

/// Audit record of one inbound webhook delivery.
///
/// The first delivery for an idempotency key holds the claim (`is_claim`);
/// later deliveries of the same key are stored with `duplicate_of` pointing
/// at the claim row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub provider: PaymentProvider,
    pub event_type: String,
    pub idempotency_key: Option<String>,
    pub is_claim: bool,
    pub duplicate_of: Option<String>,
    pub attempts: i64,
    pub received_at: i64,
    pub claimed_at: Option<i64>,
    pub raw_payload: String,
    pub signature_ok: bool,
    pub processed_ok: bool,
    pub processing_error: Option<String>,
}

/// Fields known when a delivery arrives.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: PaymentProvider,
    pub event_type: String,
    pub idempotency_key: Option<String>,
    pub raw_payload: String,
    pub signature_ok: bool,
}

/// Result of trying to take the idempotency claim for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First delivery of this key. `event_id` is the new claim row.
    Claimed { event_id: String },
    /// An earlier attempt failed or stalled; this delivery took the claim over.
    Reclaimed { event_id: String, attempts: i64 },
    /// The key is already settled or being settled. `event_id` is this
    /// delivery's own audit row, `original_id` the claim row.
    Duplicate { event_id: String, original_id: String },
}

impl ClaimOutcome {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, ClaimOutcome::Duplicate { .. })
    }
}
