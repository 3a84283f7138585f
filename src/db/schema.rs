use rusqlite::Connection;

/// Initialize the database schema. Idempotent.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        -- Donor profiles. total_trees / donations_count / last_donation_at are
        -- denormalized counters maintained by settlement; user_stats recomputes them.
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT,
            total_trees INTEGER NOT NULL DEFAULT 0 CHECK (total_trees >= 0),
            donations_count INTEGER NOT NULL DEFAULT 0 CHECK (donations_count >= 0),
            last_donation_at INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- One row per currency; price of a single tree in minor units
        CREATE TABLE IF NOT EXISTS tree_prices (
            currency TEXT PRIMARY KEY CHECK (currency IN ('RUB', 'KZT', 'USD', 'EUR')),
            price_minor INTEGER NOT NULL CHECK (price_minor > 0),
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            provider TEXT NOT NULL CHECK (provider IN ('cloudpayments', 'kaspi', 'paypal', 'tribute')),
            provider_subscription_id TEXT,
            amount_minor INTEGER NOT NULL CHECK (amount_minor > 0),
            currency TEXT NOT NULL CHECK (currency IN ('RUB', 'KZT', 'USD', 'EUR')),
            interval_months INTEGER NOT NULL DEFAULT 1 CHECK (interval_months > 0),
            status TEXT NOT NULL CHECK (status IN ('incomplete', 'active', 'past_due', 'paused', 'canceled')),
            started_at INTEGER,
            canceled_at INTEGER,
            meta TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(provider, provider_subscription_id)
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id);

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL CHECK (provider IN ('cloudpayments', 'kaspi', 'paypal', 'tribute')),
            provider_payment_id TEXT,
            user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            subscription_id TEXT REFERENCES subscriptions(id) ON DELETE SET NULL,
            amount_minor INTEGER NOT NULL CHECK (amount_minor >= 0),
            currency TEXT NOT NULL CHECK (currency IN ('RUB', 'KZT', 'USD', 'EUR')),
            status TEXT NOT NULL CHECK (status IN ('pending', 'succeeded', 'failed', 'refunded', 'canceled')),
            occurred_at INTEGER,
            meta TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(provider, provider_payment_id)
        );
        CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_id);
        CREATE INDEX IF NOT EXISTS idx_payments_subscription ON payments(subscription_id);

        -- At most one donation per payment
        CREATE TABLE IF NOT EXISTS donations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            payment_id TEXT NOT NULL UNIQUE REFERENCES payments(id) ON DELETE RESTRICT,
            project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
            referral_user_id TEXT REFERENCES users(id) ON DELETE SET NULL,
            trees_count INTEGER NOT NULL CHECK (trees_count >= 0),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_donations_user ON donations(user_id);
        CREATE INDEX IF NOT EXISTS idx_donations_project ON donations(project_id);

        -- Achievement catalog; NULL threshold = manual grant only
        CREATE TABLE IF NOT EXISTS achievements (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT,
            threshold_trees INTEGER CHECK (threshold_trees IS NULL OR threshold_trees > 0)
        );

        CREATE TABLE IF NOT EXISTS user_achievements (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            achievement_id TEXT NOT NULL REFERENCES achievements(id) ON DELETE CASCADE,
            awarded_at INTEGER NOT NULL,
            reason TEXT,
            PRIMARY KEY (user_id, achievement_id)
        );

        -- Every inbound delivery gets a row. The first delivery of an idempotency
        -- key holds the claim (is_claim = 1); the partial unique index makes the
        -- claim the dedup gate. Later deliveries point at it via duplicate_of.
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL CHECK (provider IN ('cloudpayments', 'kaspi', 'paypal', 'tribute')),
            event_type TEXT NOT NULL,
            idempotency_key TEXT,
            is_claim INTEGER NOT NULL DEFAULT 0,
            duplicate_of TEXT REFERENCES webhook_events(id),
            attempts INTEGER NOT NULL DEFAULT 0,
            received_at INTEGER NOT NULL,
            claimed_at INTEGER,
            raw_payload TEXT NOT NULL,
            signature_ok INTEGER NOT NULL,
            processed_ok INTEGER NOT NULL DEFAULT 0,
            processing_error TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_webhook_events_claim
            ON webhook_events(provider, idempotency_key) WHERE is_claim = 1;
        CREATE INDEX IF NOT EXISTS idx_webhook_events_key ON webhook_events(idempotency_key);
        CREATE INDEX IF NOT EXISTS idx_webhook_events_received ON webhook_events(received_at);

        -- Counters recomputed from donation rows, for reconciliation
        CREATE VIEW IF NOT EXISTS user_stats AS
            SELECT u.id AS user_id,
                   COALESCE(SUM(d.trees_count), 0) AS total_trees,
                   COUNT(d.id) AS donations_count,
                   MAX(d.created_at) AS last_donation_at
            FROM users u
            LEFT JOIN donations d ON d.user_id = u.id
            GROUP BY u.id;
        "#,
    )?;

    Ok(())
}
