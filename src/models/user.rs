use serde::{Deserialize, Serialize};

/// Donor profile with denormalized donation counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub total_trees: i64,
    pub donations_count: i64,
    pub last_donation_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Counters recomputed from the donations table (the `user_stats` view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub total_trees: i64,
    pub donations_count: i64,
    pub last_donation_at: Option<i64>,
}

/// A user whose stored counters disagree with their donation rows.
#[derive(Debug, Clone, Serialize)]
pub struct CounterDrift {
    pub user_id: String,
    pub stored_total_trees: i64,
    pub actual_total_trees: i64,
    pub stored_donations_count: i64,
    pub actual_donations_count: i64,
}
