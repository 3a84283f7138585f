use serde::{Deserialize, Serialize};

use super::Currency;

/// Price of planting one tree, in minor units of `currency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreePrice {
    pub currency: Currency,
    pub price_minor: i64,
    pub updated_at: i64,
}

impl TreePrice {
    /// Whole trees a payment of `amount_minor` pays for. Never negative.
    pub fn trees_for(&self, amount_minor: i64) -> i64 {
        if self.price_minor <= 0 || amount_minor <= 0 {
            return 0;
        }
        amount_minor / self.price_minor
    }
}
