use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use super::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PaymentProvider {
    CloudPayments,
    Kaspi,
    PayPal,
    Tribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    Canceled,
}

/// A single charge. Created pending by an intent (or succeeded by a
/// subscription charge) and moved forward by provider webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub provider: PaymentProvider,
    /// Provider's transaction id. Unique per provider; None until bound.
    pub provider_payment_id: Option<String>,
    pub user_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_minor: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub occurred_at: Option<i64>,
    /// Free-form metadata: return URLs, description, project_id, referral_user_id,
    /// refund_reason, webhook_processed.
    pub meta: serde_json::Value,
    pub created_at: i64,
}

impl Payment {
    /// Best-effort string lookup in metadata. Blank values count as absent.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub provider: PaymentProvider,
    pub provider_payment_id: Option<String>,
    pub user_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_minor: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub occurred_at: Option<i64>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub success_return_url: Option<String>,
    #[serde(default)]
    pub fail_return_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub referral_user_id: Option<String>,
}

/// What the client needs to open the provider's checkout widget.
#[derive(Debug, Clone, Serialize)]
pub struct IntentResponse {
    pub provider: PaymentProvider,
    pub id: String,
    pub redirect_url: String,
    pub provider_payload: serde_json::Value,
}
