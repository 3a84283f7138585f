use serde::{Deserialize, Serialize};

/// Trees planted on behalf of a user by one settled payment.
/// At most one donation exists per payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub id: String,
    pub user_id: String,
    pub payment_id: String,
    pub project_id: Option<String>,
    pub referral_user_id: Option<String>,
    pub trees_count: i64,
    pub created_at: i64,
}
