use serde::{Deserialize, Serialize};

/// Catalog entry. Entries without a threshold are granted manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub threshold_trees: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateAchievement {
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub threshold_trees: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAchievement {
    pub user_id: String,
    pub achievement_id: String,
    pub awarded_at: i64,
    pub reason: Option<String>,
}
