//! Provider-agnostic webhook events, produced by a provider's classifier and
//! consumed by the settlement engine.

use thiserror::Error;

use crate::models::Currency;

/// Why a delivery could not be turned into a settleable event. These are
/// problems with the delivery itself: they are recorded on the webhook row
/// and acknowledged, never retried by us.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown webhook type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Charge details common to one-off payments and subscription charges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeData {
    /// Provider transaction id; becomes the payment's external id.
    pub transaction_id: String,
    /// Amount in minor units of `currency`.
    pub amount_minor: Option<i64>,
    pub currency: Option<Currency>,
    /// Provider status, as sent.
    pub status: String,
    /// When the provider says the charge happened. None means "use receive time".
    pub occurred_at: Option<i64>,
    /// Our own payment or subscription id echoed back by the provider.
    pub invoice_id: Option<String>,
    /// Provider's account id (we send the user id).
    pub account_id: Option<String>,
}

impl ChargeData {
    pub fn is_succeeded(&self) -> bool {
        self.status.eq_ignore_ascii_case("succeeded")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChargeData {
    pub subscription_id: String,
    pub charge: ChargeData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundData {
    /// Transaction id of the payment being refunded.
    pub transaction_id: String,
    pub amount_minor: Option<i64>,
    pub currency: Option<Currency>,
    pub occurred_at: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Payment(ChargeData),
    SubscriptionCharge(SubscriptionChargeData),
    Refund(RefundData),
}

impl ProviderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::Payment(_) => "payment",
            ProviderEvent::SubscriptionCharge(_) => "subscription_charge",
            ProviderEvent::Refund(_) => "refund",
        }
    }
}

/// What a provider's parser pulls out of a raw body before admission.
///
/// `event_type` and `idempotency_key` are needed by the dedup step even when
/// the body cannot be classified; `event` carries the classification result.
#[derive(Debug, Clone)]
pub struct ParsedDelivery {
    pub event_type: String,
    pub idempotency_key: Option<String>,
    pub event: Result<ProviderEvent, ClassifyError>,
}
