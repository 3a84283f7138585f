pub mod from_row;
pub mod queries;
mod schema;

pub use schema::init_db;

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::SignaturePolicy;
use crate::payments::CloudPaymentsClient;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub cloudpayments: CloudPaymentsClient,
    pub signature_policy: SignaturePolicy,
    /// Age (seconds) after which an unfinished webhook claim can be retaken
    pub webhook_claim_timeout_secs: i64,
}

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
    });
    Pool::builder().max_size(10).build(manager)
}
