use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, State},
};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result, msg};
use crate::models::{Currency, TreePrice};
use crate::payments::to_major_units;

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub currency: Currency,
    pub price_minor: i64,
    /// Price of one tree in major units, as a decimal string
    pub price: String,
    pub updated_at: i64,
}

impl From<TreePrice> for PriceResponse {
    fn from(p: TreePrice) -> Self {
        let major: Decimal = to_major_units(p.price_minor, p.currency);
        Self {
            currency: p.currency,
            price_minor: p.price_minor,
            price: major.to_string(),
            updated_at: p.updated_at,
        }
    }
}

/// GET /v1/prices
pub async fn list_prices(State(state): State<AppState>) -> Result<Json<Vec<PriceResponse>>> {
    let conn = state.db.get()?;
    let prices = queries::list_tree_prices(&conn)?;
    Ok(Json(prices.into_iter().map(PriceResponse::from).collect()))
}

/// GET /v1/prices/{currency}
pub async fn get_price(
    State(state): State<AppState>,
    Path(currency): Path<String>,
) -> Result<Json<PriceResponse>> {
    let currency = Currency::from_str(&currency)
        .map_err(|_| AppError::BadRequest(format!("{}: {}", msg::UNSUPPORTED_CURRENCY, currency)))?;
    let conn = state.db.get()?;
    let price = queries::get_tree_price(&conn, currency)?
        .ok_or_else(|| AppError::NotFound(msg::PRICE_NOT_FOUND.into()))?;
    Ok(Json(price.into()))
}
