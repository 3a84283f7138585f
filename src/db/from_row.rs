//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! Models implement `FromRow` to describe how they are built from a row
//! selected with the matching `*_COLS` constant.

use rusqlite::{Connection, OptionalExtension, Row, ToSql, types::Type};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?
        .parse::<T>()
        .map_err(|_| rusqlite::Error::InvalidColumnType(col, col_name.to_string(), Type::Text))
}

/// Parse a JSON text column. Metadata is always an object; anything else is corruption.
fn parse_json(row: &Row, col: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const USER_COLS: &str =
    "id, email, display_name, total_trees, donations_count, last_donation_at, created_at";

pub const PROJECT_COLS: &str = "id, title, created_at";

pub const TREE_PRICE_COLS: &str = "currency, price_minor, updated_at";

pub const PAYMENT_COLS: &str = "id, provider, provider_payment_id, user_id, subscription_id, amount_minor, currency, status, occurred_at, meta, created_at";

pub const SUBSCRIPTION_COLS: &str = "id, user_id, provider, provider_subscription_id, amount_minor, currency, interval_months, status, started_at, canceled_at, meta, created_at";

pub const DONATION_COLS: &str =
    "id, user_id, payment_id, project_id, referral_user_id, trees_count, created_at";

pub const ACHIEVEMENT_COLS: &str = "id, code, title, description, threshold_trees";

pub const USER_ACHIEVEMENT_COLS: &str = "user_id, achievement_id, awarded_at, reason";

pub const WEBHOOK_EVENT_COLS: &str = "id, provider, event_type, idempotency_key, is_claim, duplicate_of, attempts, received_at, claimed_at, raw_payload, signature_ok, processed_ok, processing_error";

pub const USER_STATS_COLS: &str = "user_id, total_trees, donations_count, last_donation_at";

// ============ FromRow Implementations ============

impl FromRow for User {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            total_trees: row.get(3)?,
            donations_count: row.get(4)?,
            last_donation_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl FromRow for Project {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Project {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: row.get(2)?,
        })
    }
}

impl FromRow for TreePrice {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TreePrice {
            currency: parse_enum(row, 0, "currency")?,
            price_minor: row.get(1)?,
            updated_at: row.get(2)?,
        })
    }
}

impl FromRow for Payment {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Payment {
            id: row.get(0)?,
            provider: parse_enum(row, 1, "provider")?,
            provider_payment_id: row.get(2)?,
            user_id: row.get(3)?,
            subscription_id: row.get(4)?,
            amount_minor: row.get(5)?,
            currency: parse_enum(row, 6, "currency")?,
            status: parse_enum(row, 7, "status")?,
            occurred_at: row.get(8)?,
            meta: parse_json(row, 9)?,
            created_at: row.get(10)?,
        })
    }
}

impl FromRow for Subscription {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Subscription {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider: parse_enum(row, 2, "provider")?,
            provider_subscription_id: row.get(3)?,
            amount_minor: row.get(4)?,
            currency: parse_enum(row, 5, "currency")?,
            interval_months: row.get(6)?,
            status: parse_enum(row, 7, "status")?,
            started_at: row.get(8)?,
            canceled_at: row.get(9)?,
            meta: parse_json(row, 10)?,
            created_at: row.get(11)?,
        })
    }
}

impl FromRow for Donation {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Donation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            payment_id: row.get(2)?,
            project_id: row.get(3)?,
            referral_user_id: row.get(4)?,
            trees_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl FromRow for Achievement {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Achievement {
            id: row.get(0)?,
            code: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            threshold_trees: row.get(4)?,
        })
    }
}

impl FromRow for UserAchievement {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UserAchievement {
            user_id: row.get(0)?,
            achievement_id: row.get(1)?,
            awarded_at: row.get(2)?,
            reason: row.get(3)?,
        })
    }
}

impl FromRow for WebhookEvent {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(WebhookEvent {
            id: row.get(0)?,
            provider: parse_enum(row, 1, "provider")?,
            event_type: row.get(2)?,
            idempotency_key: row.get(3)?,
            is_claim: row.get::<_, i32>(4)? != 0,
            duplicate_of: row.get(5)?,
            attempts: row.get(6)?,
            received_at: row.get(7)?,
            claimed_at: row.get(8)?,
            raw_payload: row.get(9)?,
            signature_ok: row.get::<_, i32>(10)? != 0,
            processed_ok: row.get::<_, i32>(11)? != 0,
            processing_error: row.get(12)?,
        })
    }
}

impl FromRow for UserStats {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UserStats {
            user_id: row.get(0)?,
            total_trees: row.get(1)?,
            donations_count: row.get(2)?,
            last_donation_at: row.get(3)?,
        })
    }
}

impl FromRow for CounterDrift {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(CounterDrift {
            user_id: row.get(0)?,
            stored_total_trees: row.get(1)?,
            actual_total_trees: row.get(2)?,
            stored_donations_count: row.get(3)?,
            actual_donations_count: row.get(4)?,
        })
    }
}
