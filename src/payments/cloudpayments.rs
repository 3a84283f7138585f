use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use hmac::{Hmac, Mac};
use rusqlite::Connection;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{
    CreatePayment, Currency, IntentResponse, PaymentIntentRequest, PaymentProvider, PaymentStatus,
    SubscriptionIntentRequest,
};
use crate::settlement::ClassifyError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex-encoded HMAC-SHA256 of `payload` keyed by `secret`.
///
/// An empty secret disables verification and always returns true.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            tracing::error!("{}", msg::INVALID_WEBHOOK_SECRET);
            return false;
        }
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    // Length is not secret (always 32 bytes for SHA-256)
    if provided.len() != expected.len() {
        return false;
    }

    expected.as_slice().ct_eq(&provided).into()
}

/// Convert a decimal major-unit amount ("95.00", "1900") into minor units.
///
/// Negative amounts and amounts finer than the currency's minor unit are rejected
/// rather than rounded.
pub fn to_minor_units(amount: &str, currency: Currency) -> std::result::Result<i64, ClassifyError> {
    let trimmed = amount.trim();
    let value = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| ClassifyError::InvalidAmount(amount.to_string()))?;

    if value.is_sign_negative() && !value.is_zero() {
        return Err(ClassifyError::InvalidAmount(amount.to_string()));
    }

    let scale = Decimal::from(10_i64.pow(currency.minor_exponent()));
    let minor = value
        .checked_mul(scale)
        .ok_or_else(|| ClassifyError::InvalidAmount(amount.to_string()))?;

    if !minor.fract().is_zero() {
        return Err(ClassifyError::InvalidAmount(amount.to_string()));
    }

    minor
        .to_i64()
        .ok_or_else(|| ClassifyError::InvalidAmount(amount.to_string()))
}

/// Major-unit decimal for display and provider widgets.
pub fn to_major_units(amount_minor: i64, currency: Currency) -> Decimal {
    Decimal::new(amount_minor, currency.minor_exponent())
}

/// Parse a provider timestamp into unix seconds. Accepts RFC 3339 and the
/// naive `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS` forms, read as UTC.
pub fn parse_occurred_at(value: &str) -> std::result::Result<i64, ClassifyError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    Err(ClassifyError::InvalidTimestamp(value.to_string()))
}

/// Accept ids and amounts sent either as JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// CloudPayments notification body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloudPaymentsNotification {
    #[serde(rename = "Type", default)]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub transaction_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub account_id: Option<String>,
    #[serde(default, alias = "DateTime")]
    pub occurred_at: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub subscription_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub invoice_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CloudPaymentsNotification {
    pub fn from_slice(body: &[u8]) -> std::result::Result<Self, ClassifyError> {
        serde_json::from_slice(body).map_err(|e| ClassifyError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CloudPaymentsClient {
    public_id: String,
    webhook_secret: String,
    base_url: String,
}

impl CloudPaymentsClient {
    /// Primary header carrying the body HMAC; some integrations send the X- variant.
    pub const SIGNATURE_HEADER: &'static str = "Content-HMAC";
    pub const SIGNATURE_HEADER_FALLBACK: &'static str = "X-Content-HMAC";

    pub fn new(public_id: &str, webhook_secret: &str, base_url: &str) -> Self {
        Self {
            public_id: public_id.to_string(),
            webhook_secret: webhook_secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(payload, signature, &self.webhook_secret)
    }

    /// Create a pending one-off payment and the widget payload that pays it.
    /// The payment id travels to the provider as `invoiceId` so the webhook
    /// can be matched back before the provider transaction id is known.
    pub fn create_payment_intent(
        &self,
        conn: &Connection,
        user_id: &str,
        request: &PaymentIntentRequest,
    ) -> Result<IntentResponse> {
        let currency = parse_currency(&request.currency)?;
        if request.amount_minor <= 0 {
            return Err(AppError::BadRequest(msg::AMOUNT_MUST_BE_POSITIVE.into()));
        }
        ensure_user(conn, user_id)?;
        ensure_project(conn, request.project_id.as_deref())?;

        let meta = json!({
            "success_return_url": request.success_return_url,
            "fail_return_url": request.fail_return_url,
            "description": request.description,
            "project_id": request.project_id,
            "referral_user_id": request.referral_user_id,
        });

        let payment = queries::create_payment(
            conn,
            &CreatePayment {
                provider: PaymentProvider::CloudPayments,
                provider_payment_id: None,
                user_id: Some(user_id.to_string()),
                subscription_id: None,
                amount_minor: request.amount_minor,
                currency,
                status: PaymentStatus::Pending,
                occurred_at: None,
                meta,
            },
        )?;

        tracing::info!(
            "Created payment intent {} for user {} ({} {})",
            payment.id,
            user_id,
            to_major_units(payment.amount_minor, currency),
            currency
        );

        Ok(IntentResponse {
            provider: PaymentProvider::CloudPayments,
            redirect_url: format!("{}/pay/{}", self.base_url, payment.id),
            provider_payload: json!({
                "publicId": self.public_id,
                "paymentId": payment.id,
                "invoiceId": payment.id,
                "accountId": user_id,
                "amount": to_major_units(payment.amount_minor, currency).to_f64(),
                "currency": currency,
                "description": request.description.as_deref().unwrap_or("Tree planting donation"),
            }),
            id: payment.id,
        })
    }

    /// Create an incomplete recurring subscription and its widget payload.
    /// It becomes active on the first successful charge webhook.
    pub fn create_subscription_intent(
        &self,
        conn: &Connection,
        user_id: &str,
        request: &SubscriptionIntentRequest,
    ) -> Result<IntentResponse> {
        let currency = parse_currency(&request.currency)?;
        if request.amount_minor <= 0 {
            return Err(AppError::BadRequest(msg::AMOUNT_MUST_BE_POSITIVE.into()));
        }
        if request.interval_count <= 0 {
            return Err(AppError::BadRequest(msg::INTERVAL_COUNT_MUST_BE_POSITIVE.into()));
        }
        ensure_user(conn, user_id)?;
        ensure_project(conn, request.project_id.as_deref())?;

        let interval_months = request.interval_months();
        let meta = json!({
            "description": request.description,
            "project_id": request.project_id,
            "referral_user_id": request.referral_user_id,
        });

        let subscription = queries::create_subscription(
            conn,
            user_id,
            PaymentProvider::CloudPayments,
            request.amount_minor,
            currency,
            interval_months,
            &meta,
        )?;

        tracing::info!(
            "Created subscription intent {} for user {} every {} month(s)",
            subscription.id,
            user_id,
            interval_months
        );

        Ok(IntentResponse {
            provider: PaymentProvider::CloudPayments,
            redirect_url: format!("{}/subscribe/{}", self.base_url, subscription.id),
            provider_payload: json!({
                "publicId": self.public_id,
                "invoiceId": subscription.id,
                "accountId": user_id,
                "amount": to_major_units(subscription.amount_minor, currency).to_f64(),
                "currency": currency,
                "description": request.description.as_deref().unwrap_or("Monthly tree planting"),
                "recurrent": {
                    "interval": "Month",
                    "period": interval_months,
                },
            }),
            id: subscription.id,
        })
    }
}

fn parse_currency(code: &str) -> Result<Currency> {
    Currency::from_str(code.trim())
        .map_err(|_| AppError::BadRequest(format!("{}: {}", msg::UNSUPPORTED_CURRENCY, code)))
}

fn ensure_user(conn: &Connection, user_id: &str) -> Result<()> {
    if queries::user_exists(conn, user_id)? {
        Ok(())
    } else {
        Err(AppError::NotFound(msg::USER_NOT_FOUND.into()))
    }
}

fn ensure_project(conn: &Connection, project_id: Option<&str>) -> Result<()> {
    match project_id {
        Some(id) if queries::get_project_by_id(conn, id)?.is_none() => {
            Err(AppError::BadRequest("Project not found".into()))
        }
        _ => Ok(()),
    }
}
