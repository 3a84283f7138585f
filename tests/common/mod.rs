//! Test utilities and fixtures for Grove integration tests

#![allow(dead_code)]

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde_json::{Value, json};

pub use grove::config::SignaturePolicy;
pub use grove::db::{AppState, DbPool, init_db, queries};
pub use grove::models::*;
pub use grove::payments::CloudPaymentsClient;

pub const TEST_SECRET: &str = "cp_test_secret_123";
pub const TEST_PUBLIC_ID: &str = "pk_test_public";
pub const TEST_BASE_URL: &str = "http://localhost:3000";

pub const RUB_TREE_PRICE: i64 = 1900;

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

pub fn test_client() -> CloudPaymentsClient {
    CloudPaymentsClient::new(TEST_PUBLIC_ID, TEST_SECRET, TEST_BASE_URL)
}

fn app_state_with_pool(pool: DbPool, policy: SignaturePolicy, secret: &str) -> AppState {
    AppState {
        db: pool,
        cloudpayments: CloudPaymentsClient::new(TEST_PUBLIC_ID, secret, TEST_BASE_URL),
        signature_policy: policy,
        webhook_claim_timeout_secs: 300,
    }
}

/// App state over a single-connection in-memory pool (each in-memory
/// connection is its own database, so the pool must not open a second one).
pub fn create_test_app_state() -> AppState {
    create_test_app_state_with(SignaturePolicy::Reject, TEST_SECRET)
}

pub fn create_test_app_state_with(policy: SignaturePolicy, secret: &str) -> AppState {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }
    app_state_with_pool(pool, policy, secret)
}

/// App state over a file database, for tests that need real concurrency.
pub fn create_file_app_state(path: &std::path::Path, max_size: u32) -> AppState {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.busy_timeout(std::time::Duration::from_secs(30))?;
        c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
    });
    let pool = Pool::builder().max_size(max_size).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }
    app_state_with_pool(pool, SignaturePolicy::Reject, TEST_SECRET)
}

pub fn create_test_user(conn: &Connection, email: &str) -> User {
    queries::create_user(
        conn,
        &CreateUser {
            email: email.to_string(),
            display_name: None,
        },
    )
    .expect("Failed to create test user")
}

pub fn create_test_project(conn: &Connection, title: &str) -> Project {
    queries::create_project(conn, title).expect("Failed to create test project")
}

pub fn set_tree_price(conn: &Connection, currency: Currency, price_minor: i64) {
    queries::upsert_tree_price(conn, currency, price_minor).expect("Failed to set tree price");
}

/// Install the built-in catalog (first_tree=1, tree_planter=10, ...).
pub fn seed_achievements(conn: &Connection) {
    grove::achievements::seed_catalog(conn).expect("Failed to seed achievements");
}

/// Pending CloudPayments payment already bound to a provider transaction id.
pub fn create_test_payment(
    conn: &Connection,
    user_id: Option<&str>,
    transaction_id: &str,
    amount_minor: i64,
    currency: Currency,
    meta: Value,
) -> Payment {
    queries::create_payment(
        conn,
        &CreatePayment {
            provider: PaymentProvider::CloudPayments,
            provider_payment_id: Some(transaction_id.to_string()),
            user_id: user_id.map(String::from),
            subscription_id: None,
            amount_minor,
            currency,
            status: PaymentStatus::Pending,
            occurred_at: None,
            meta,
        },
    )
    .expect("Failed to create test payment")
}

/// Subscription bound to a provider subscription id.
pub fn create_test_subscription(
    conn: &Connection,
    user_id: &str,
    provider_subscription_id: &str,
    amount_minor: i64,
    currency: Currency,
    meta: Value,
) -> Subscription {
    let sub = queries::create_subscription(
        conn,
        user_id,
        PaymentProvider::CloudPayments,
        amount_minor,
        currency,
        1,
        &meta,
    )
    .expect("Failed to create test subscription");
    queries::bind_subscription_provider_id(
        conn,
        &sub.id,
        PaymentProvider::CloudPayments,
        provider_subscription_id,
    )
    .expect("Failed to bind subscription")
    .expect("Subscription should bind")
}

pub fn compute_signature(payload: &[u8], secret: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// CloudPayments "Payment" notification body.
pub fn payment_payload(transaction_id: &str, amount: &str, currency: &str, status: &str) -> Vec<u8> {
    json!({
        "Type": "Payment",
        "TransactionId": transaction_id,
        "Amount": amount.parse::<f64>().unwrap(),
        "Currency": currency,
        "Status": status,
        "OccurredAt": "2024-05-01T10:00:00Z",
    })
    .to_string()
    .into_bytes()
}

pub fn subscription_charge_payload(
    transaction_id: &str,
    subscription_id: &str,
    amount: &str,
    currency: &str,
) -> Vec<u8> {
    json!({
        "Type": "SubscriptionCharge",
        "TransactionId": transaction_id,
        "SubscriptionId": subscription_id,
        "Amount": amount.parse::<f64>().unwrap(),
        "Currency": currency,
        "Status": "Succeeded",
        "OccurredAt": "2024-05-01T10:00:00Z",
    })
    .to_string()
    .into_bytes()
}

pub fn refund_payload(transaction_id: &str, reason: Option<&str>) -> Vec<u8> {
    let mut body = json!({
        "Type": "Refund",
        "TransactionId": transaction_id,
        "Status": "Succeeded",
        "OccurredAt": "2024-05-02T10:00:00Z",
    });
    if let Some(reason) = reason {
        body["Reason"] = json!(reason);
    }
    body.to_string().into_bytes()
}

/// Deliver a signed body through the full pipeline.
pub fn deliver(state: &AppState, body: &[u8]) -> (axum::http::StatusCode, &'static str) {
    let signature = compute_signature(body, TEST_SECRET);
    grove::handlers::webhooks::handle_webhook_delivery(state, "cloudpayments", body, Some(&signature))
}

pub fn donation_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM donations", [], |r| r.get(0))
        .unwrap()
}

pub fn webhook_event_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM webhook_events", [], |r| r.get(0))
        .unwrap()
}
