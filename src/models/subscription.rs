use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use super::{Currency, PaymentProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    /// Whether a successful charge should move the subscription to active.
    pub fn activates_on_charge(&self) -> bool {
        matches!(self, SubscriptionStatus::Incomplete | SubscriptionStatus::PastDue)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub provider: PaymentProvider,
    pub provider_subscription_id: Option<String>,
    pub amount_minor: i64,
    pub currency: Currency,
    pub interval_months: i64,
    pub status: SubscriptionStatus,
    pub started_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub meta: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub interval: BillingInterval,
    #[serde(default = "default_interval_count")]
    pub interval_count: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub referral_user_id: Option<String>,
}

fn default_interval_count() -> i64 {
    1
}

impl SubscriptionIntentRequest {
    pub fn interval_months(&self) -> i64 {
        match self.interval {
            BillingInterval::Monthly => self.interval_count,
            BillingInterval::Yearly => self.interval_count * 12,
        }
    }
}
