use serde::{Deserialize, Serialize};

/// Planting project a donation may be attributed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub created_at: i64,
}
