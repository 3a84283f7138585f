use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::{AppError, Result};
use crate::id::EntityType;
use crate::models::*;

use super::from_row::{
    ACHIEVEMENT_COLS, DONATION_COLS, PAYMENT_COLS, PROJECT_COLS, SUBSCRIPTION_COLS,
    TREE_PRICE_COLS, USER_ACHIEVEMENT_COLS, USER_COLS, USER_STATS_COLS, WEBHOOK_EVENT_COLS,
    query_all, query_one,
};

pub fn now() -> i64 {
    Utc::now().timestamp()
}

// ============ Users ============

pub fn create_user(conn: &Connection, input: &CreateUser) -> Result<User> {
    let id = EntityType::User.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO users (id, email, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![&id, &input.email, &input.display_name, now],
    )?;
    Ok(User {
        id,
        email: input.email.clone(),
        display_name: input.display_name.clone(),
        total_trees: 0,
        donations_count: 0,
        last_donation_at: None,
        created_at: now,
    })
}

pub fn get_user_by_id(conn: &Connection, id: &str) -> Result<Option<User>> {
    query_one(
        conn,
        &format!("SELECT {} FROM users WHERE id = ?1", USER_COLS),
        &[&id],
    )
}

pub fn user_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    query_all(
        conn,
        &format!("SELECT {} FROM users ORDER BY created_at, id", USER_COLS),
        &[],
    )
}

/// Add trees to a user's counters in one statement and return the new total.
/// Returns None if the user row does not exist.
pub fn increment_user_counters(
    conn: &Connection,
    user_id: &str,
    trees: i64,
    donated_at: i64,
) -> Result<Option<i64>> {
    conn.query_row(
        "UPDATE users
         SET total_trees = total_trees + ?2,
             donations_count = donations_count + 1,
             last_donation_at = ?3
         WHERE id = ?1
         RETURNING total_trees",
        params![user_id, trees, donated_at],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

// ============ Projects ============

pub fn create_project(conn: &Connection, title: &str) -> Result<Project> {
    let id = EntityType::Project.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO projects (id, title, created_at) VALUES (?1, ?2, ?3)",
        params![&id, title, now],
    )?;
    Ok(Project {
        id,
        title: title.to_string(),
        created_at: now,
    })
}

pub fn get_project_by_id(conn: &Connection, id: &str) -> Result<Option<Project>> {
    query_one(
        conn,
        &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLS),
        &[&id],
    )
}

// ============ Tree Prices ============

pub fn upsert_tree_price(conn: &Connection, currency: Currency, price_minor: i64) -> Result<TreePrice> {
    if price_minor <= 0 {
        return Err(AppError::BadRequest("Tree price must be positive".into()));
    }
    let now = now();
    conn.execute(
        "INSERT INTO tree_prices (currency, price_minor, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(currency) DO UPDATE SET price_minor = excluded.price_minor, updated_at = excluded.updated_at",
        params![currency.as_ref(), price_minor, now],
    )?;
    Ok(TreePrice {
        currency,
        price_minor,
        updated_at: now,
    })
}

pub fn get_tree_price(conn: &Connection, currency: Currency) -> Result<Option<TreePrice>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tree_prices WHERE currency = ?1", TREE_PRICE_COLS),
        &[&currency.as_ref()],
    )
}

pub fn list_tree_prices(conn: &Connection) -> Result<Vec<TreePrice>> {
    query_all(
        conn,
        &format!("SELECT {} FROM tree_prices ORDER BY currency", TREE_PRICE_COLS),
        &[],
    )
}

// ============ Payments ============

pub fn create_payment(conn: &Connection, input: &CreatePayment) -> Result<Payment> {
    let id = EntityType::Payment.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO payments (id, provider, provider_payment_id, user_id, subscription_id, amount_minor, currency, status, occurred_at, meta, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            &id,
            input.provider.as_ref(),
            &input.provider_payment_id,
            &input.user_id,
            &input.subscription_id,
            input.amount_minor,
            input.currency.as_ref(),
            input.status.as_ref(),
            input.occurred_at,
            input.meta.to_string(),
            now,
        ],
    )?;
    Ok(Payment {
        id,
        provider: input.provider,
        provider_payment_id: input.provider_payment_id.clone(),
        user_id: input.user_id.clone(),
        subscription_id: input.subscription_id.clone(),
        amount_minor: input.amount_minor,
        currency: input.currency,
        status: input.status,
        occurred_at: input.occurred_at,
        meta: input.meta.clone(),
        created_at: now,
    })
}

pub fn get_payment_by_id(conn: &Connection, id: &str) -> Result<Option<Payment>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLS),
        &[&id],
    )
}

pub fn get_payment_by_provider_id(
    conn: &Connection,
    provider: PaymentProvider,
    provider_payment_id: &str,
) -> Result<Option<Payment>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payments WHERE provider = ?1 AND provider_payment_id = ?2",
            PAYMENT_COLS
        ),
        &[&provider.as_ref(), &provider_payment_id],
    )
}

/// Attach a provider transaction id to a payment that does not have one yet.
/// Returns None if the payment does not exist, belongs to another provider,
/// or is already bound.
pub fn bind_payment_provider_id(
    conn: &Connection,
    payment_id: &str,
    provider: PaymentProvider,
    provider_payment_id: &str,
) -> Result<Option<Payment>> {
    query_one(
        conn,
        &format!(
            "UPDATE payments SET provider_payment_id = ?3
             WHERE id = ?1 AND provider = ?2 AND provider_payment_id IS NULL
             RETURNING {}",
            PAYMENT_COLS
        ),
        &[&payment_id, &provider.as_ref(), &provider_payment_id],
    )
}

/// Set status, occurrence time and the full metadata document.
pub fn update_payment_status(
    conn: &Connection,
    payment_id: &str,
    status: PaymentStatus,
    occurred_at: i64,
    meta: &serde_json::Value,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE payments SET status = ?2, occurred_at = ?3, meta = ?4 WHERE id = ?1",
        params![payment_id, status.as_ref(), occurred_at, meta.to_string()],
    )?;
    Ok(affected > 0)
}

pub fn list_payments_for_subscription(conn: &Connection, subscription_id: &str) -> Result<Vec<Payment>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payments WHERE subscription_id = ?1 ORDER BY created_at, id",
            PAYMENT_COLS
        ),
        &[&subscription_id],
    )
}

// ============ Subscriptions ============

pub fn create_subscription(
    conn: &Connection,
    user_id: &str,
    provider: PaymentProvider,
    amount_minor: i64,
    currency: Currency,
    interval_months: i64,
    meta: &serde_json::Value,
) -> Result<Subscription> {
    let id = EntityType::Subscription.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO subscriptions (id, user_id, provider, amount_minor, currency, interval_months, status, meta, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            &id,
            user_id,
            provider.as_ref(),
            amount_minor,
            currency.as_ref(),
            interval_months,
            SubscriptionStatus::Incomplete.as_ref(),
            meta.to_string(),
            now,
        ],
    )?;
    Ok(Subscription {
        id,
        user_id: user_id.to_string(),
        provider,
        provider_subscription_id: None,
        amount_minor,
        currency,
        interval_months,
        status: SubscriptionStatus::Incomplete,
        started_at: None,
        canceled_at: None,
        meta: meta.clone(),
        created_at: now,
    })
}

pub fn get_subscription_by_id(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLS),
        &[&id],
    )
}

pub fn get_subscription_by_provider_id(
    conn: &Connection,
    provider: PaymentProvider,
    provider_subscription_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE provider = ?1 AND provider_subscription_id = ?2",
            SUBSCRIPTION_COLS
        ),
        &[&provider.as_ref(), &provider_subscription_id],
    )
}

/// Attach a provider subscription id to a subscription that does not have one yet.
pub fn bind_subscription_provider_id(
    conn: &Connection,
    subscription_id: &str,
    provider: PaymentProvider,
    provider_subscription_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "UPDATE subscriptions SET provider_subscription_id = ?3
             WHERE id = ?1 AND provider = ?2 AND provider_subscription_id IS NULL
             RETURNING {}",
            SUBSCRIPTION_COLS
        ),
        &[&subscription_id, &provider.as_ref(), &provider_subscription_id],
    )
}

/// Move a subscription to active, keeping the original start time if it had one.
pub fn activate_subscription(conn: &Connection, subscription_id: &str, at: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE subscriptions SET status = ?2, started_at = COALESCE(started_at, ?3) WHERE id = ?1",
        params![subscription_id, SubscriptionStatus::Active.as_ref(), at],
    )?;
    Ok(affected > 0)
}

// ============ Donations ============

pub fn create_donation(
    conn: &Connection,
    user_id: &str,
    payment_id: &str,
    project_id: Option<&str>,
    referral_user_id: Option<&str>,
    trees_count: i64,
    created_at: i64,
) -> Result<Donation> {
    let id = EntityType::Donation.gen_id();
    conn.execute(
        "INSERT INTO donations (id, user_id, payment_id, project_id, referral_user_id, trees_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![&id, user_id, payment_id, project_id, referral_user_id, trees_count, created_at],
    )?;
    Ok(Donation {
        id,
        user_id: user_id.to_string(),
        payment_id: payment_id.to_string(),
        project_id: project_id.map(String::from),
        referral_user_id: referral_user_id.map(String::from),
        trees_count,
        created_at,
    })
}

pub fn get_donation_by_payment(conn: &Connection, payment_id: &str) -> Result<Option<Donation>> {
    query_one(
        conn,
        &format!("SELECT {} FROM donations WHERE payment_id = ?1", DONATION_COLS),
        &[&payment_id],
    )
}

pub fn list_donations_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Donation>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM donations WHERE user_id = ?1 ORDER BY created_at, id",
            DONATION_COLS
        ),
        &[&user_id],
    )
}

// ============ Achievements ============

/// Insert a catalog entry, or return the existing one with the same code.
pub fn create_achievement(conn: &Connection, input: &CreateAchievement) -> Result<Achievement> {
    conn.execute(
        "INSERT INTO achievements (id, code, title, description, threshold_trees)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(code) DO NOTHING",
        params![
            EntityType::Achievement.gen_id(),
            &input.code,
            &input.title,
            &input.description,
            input.threshold_trees,
        ],
    )?;
    get_achievement_by_code(conn, &input.code)?
        .ok_or_else(|| AppError::Internal(format!("achievement {} missing after insert", input.code)))
}

pub fn get_achievement_by_code(conn: &Connection, code: &str) -> Result<Option<Achievement>> {
    query_one(
        conn,
        &format!("SELECT {} FROM achievements WHERE code = ?1", ACHIEVEMENT_COLS),
        &[&code],
    )
}

pub fn list_achievements(conn: &Connection) -> Result<Vec<Achievement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM achievements ORDER BY threshold_trees IS NULL, threshold_trees, code",
            ACHIEVEMENT_COLS
        ),
        &[],
    )
}

/// Threshold achievements a user with `total_trees` has reached, lowest first.
/// Manual-only entries (NULL threshold) never match.
pub fn list_reached_achievements(conn: &Connection, total_trees: i64) -> Result<Vec<Achievement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM achievements
             WHERE threshold_trees IS NOT NULL AND threshold_trees <= ?1
             ORDER BY threshold_trees, code",
            ACHIEVEMENT_COLS
        ),
        &[&total_trees],
    )
}

pub fn user_has_achievement(conn: &Connection, user_id: &str, achievement_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM user_achievements WHERE user_id = ?1 AND achievement_id = ?2",
            params![user_id, achievement_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Grant an achievement. Returns false if the user already held it.
pub fn grant_achievement(
    conn: &Connection,
    user_id: &str,
    achievement_id: &str,
    reason: Option<&str>,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO user_achievements (user_id, achievement_id, awarded_at, reason)
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, achievement_id, now(), reason],
    )?;
    Ok(affected > 0)
}

pub fn list_user_achievements(conn: &Connection, user_id: &str) -> Result<Vec<UserAchievement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM user_achievements WHERE user_id = ?1 ORDER BY awarded_at, achievement_id",
            USER_ACHIEVEMENT_COLS
        ),
        &[&user_id],
    )
}

// ============ Webhook Events ============

/// Try to take the idempotency claim for a delivery.
///
/// Runs in an IMMEDIATE transaction so exactly one concurrent delivery of a
/// key can insert or retake the claim row:
/// - no claim row yet: insert one, `Claimed`
/// - claim row whose last attempt failed, or that has been in flight since
///   before `stale_before`: retake it, `Reclaimed`
/// - otherwise: store an audit row pointing at the claim, `Duplicate`
pub fn try_claim_webhook_event(
    conn: &mut Connection,
    event: &NewWebhookEvent,
    stale_before: i64,
) -> Result<ClaimOutcome> {
    let key = event
        .idempotency_key
        .as_deref()
        .ok_or_else(|| AppError::Internal("webhook claim requires an idempotency key".into()))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now();
    let event_id = EntityType::WebhookEvent.gen_id();

    let inserted = tx.execute(
        "INSERT OR IGNORE INTO webhook_events
            (id, provider, event_type, idempotency_key, is_claim, attempts, received_at, claimed_at, raw_payload, signature_ok)
         VALUES (?1, ?2, ?3, ?4, 1, 1, ?5, ?5, ?6, ?7)",
        params![
            &event_id,
            event.provider.as_ref(),
            &event.event_type,
            key,
            now,
            &event.raw_payload,
            event.signature_ok,
        ],
    )?;
    if inserted > 0 {
        tx.commit()?;
        return Ok(ClaimOutcome::Claimed { event_id });
    }

    let retaken: Option<(String, i64)> = tx
        .query_row(
            "UPDATE webhook_events
             SET attempts = attempts + 1, claimed_at = ?3, processing_error = NULL,
                 event_type = ?4, raw_payload = ?5, signature_ok = ?6
             WHERE provider = ?1 AND idempotency_key = ?2 AND is_claim = 1 AND processed_ok = 0
               AND (processing_error IS NOT NULL OR claimed_at < ?7)
             RETURNING id, attempts",
            params![
                event.provider.as_ref(),
                key,
                now,
                &event.event_type,
                &event.raw_payload,
                event.signature_ok,
                stale_before,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((event_id, attempts)) = retaken {
        tx.commit()?;
        return Ok(ClaimOutcome::Reclaimed { event_id, attempts });
    }

    let original_id: String = tx.query_row(
        "SELECT id FROM webhook_events WHERE provider = ?1 AND idempotency_key = ?2 AND is_claim = 1",
        params![event.provider.as_ref(), key],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO webhook_events
            (id, provider, event_type, idempotency_key, is_claim, duplicate_of, received_at, raw_payload, signature_ok, processed_ok)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, 1)",
        params![
            &event_id,
            event.provider.as_ref(),
            &event.event_type,
            key,
            &original_id,
            now,
            &event.raw_payload,
            event.signature_ok,
        ],
    )?;
    tx.commit()?;

    Ok(ClaimOutcome::Duplicate {
        event_id,
        original_id,
    })
}

/// Store a delivery that never reached the claim step (bad signature,
/// unparseable body, no idempotency key).
pub fn record_webhook_event(
    conn: &Connection,
    event: &NewWebhookEvent,
    processing_error: Option<&str>,
) -> Result<String> {
    let id = EntityType::WebhookEvent.gen_id();
    conn.execute(
        "INSERT INTO webhook_events
            (id, provider, event_type, idempotency_key, is_claim, received_at, raw_payload, signature_ok, processed_ok, processing_error)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, 0, ?8)",
        params![
            &id,
            event.provider.as_ref(),
            &event.event_type,
            &event.idempotency_key,
            now(),
            &event.raw_payload,
            event.signature_ok,
            processing_error,
        ],
    )?;
    Ok(id)
}

pub fn mark_webhook_processed(conn: &Connection, event_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE webhook_events SET processed_ok = 1, processing_error = NULL WHERE id = ?1",
        params![event_id],
    )?;
    Ok(affected > 0)
}

pub fn mark_webhook_failed(conn: &Connection, event_id: &str, error: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE webhook_events SET processed_ok = 0, processing_error = ?2 WHERE id = ?1",
        params![event_id, error],
    )?;
    Ok(affected > 0)
}

pub fn get_webhook_event(conn: &Connection, id: &str) -> Result<Option<WebhookEvent>> {
    query_one(
        conn,
        &format!("SELECT {} FROM webhook_events WHERE id = ?1", WEBHOOK_EVENT_COLS),
        &[&id],
    )
}

/// All deliveries recorded for a key, claim row first.
pub fn list_webhook_events_by_key(
    conn: &Connection,
    provider: PaymentProvider,
    idempotency_key: &str,
) -> Result<Vec<WebhookEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM webhook_events
             WHERE provider = ?1 AND idempotency_key = ?2
             ORDER BY is_claim DESC, received_at, rowid",
            WEBHOOK_EVENT_COLS
        ),
        &[&provider.as_ref(), &idempotency_key],
    )
}

pub fn list_webhook_events(conn: &Connection) -> Result<Vec<WebhookEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM webhook_events ORDER BY received_at, rowid",
            WEBHOOK_EVENT_COLS
        ),
        &[],
    )
}

// ============ Reconciliation ============

pub fn get_user_stats(conn: &Connection, user_id: &str) -> Result<Option<UserStats>> {
    query_one(
        conn,
        &format!("SELECT {} FROM user_stats WHERE user_id = ?1", USER_STATS_COLS),
        &[&user_id],
    )
}

/// Users whose stored counters disagree with their donation rows.
pub fn list_counter_drift(conn: &Connection) -> Result<Vec<CounterDrift>> {
    query_all(
        conn,
        "SELECT u.id, u.total_trees, s.total_trees, u.donations_count, s.donations_count
         FROM users u
         JOIN user_stats s ON s.user_id = u.id
         WHERE u.total_trees != s.total_trees OR u.donations_count != s.donations_count
         ORDER BY u.id",
        &[],
    )
}
