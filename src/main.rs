use axum::Router;
use clap::Parser;
use rusqlite::Connection;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grove::achievements;
use grove::config::Config;
use grove::db::{AppState, create_pool, init_db, queries};
use grove::handlers;
use grove::models::{CreateUser, Currency, PaymentIntentRequest};
use grove::payments::CloudPaymentsClient;

/// Dev tree prices, installed when a currency has none yet (minor units).
const DEFAULT_TREE_PRICES: &[(Currency, i64)] = &[
    (Currency::Rub, 1900),
    (Currency::Kzt, 950),
    (Currency::Usd, 2500),
    (Currency::Eur, 2300),
];

#[derive(Parser, Debug)]
#[command(name = "grove")]
#[command(about = "Tree-planting donation backend")]
struct Cli {
    /// Seed the database with dev data (prices, catalog, user, project, pending payment)
    #[arg(long)]
    seed: bool,

    /// Re-derive achievements, report counter drift, then exit
    #[arg(long)]
    reconcile: bool,
}

/// Install the achievement catalog and any missing tree prices.
fn ensure_reference_data(conn: &Connection) -> grove::error::Result<()> {
    achievements::seed_catalog(conn)?;
    for (currency, price_minor) in DEFAULT_TREE_PRICES {
        if queries::get_tree_price(conn, *currency)?.is_none() {
            queries::upsert_tree_price(conn, *currency, *price_minor)?;
            tracing::info!("Installed default tree price {} {}", price_minor, currency);
        }
    }
    Ok(())
}

fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    ensure_reference_data(&conn).expect("Failed to install reference data");

    if !queries::list_users(&conn)
        .expect("Failed to list users")
        .is_empty()
    {
        tracing::info!("Database already has data, skipping seed");
        return;
    }

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let user = queries::create_user(
        &conn,
        &CreateUser {
            email: "dev@grove.local".to_string(),
            display_name: Some("Dev Donor".to_string()),
        },
    )
    .expect("Failed to create dev user");

    let project = queries::create_project(&conn, "Dev Forest").expect("Failed to create dev project");

    let intent = state
        .cloudpayments
        .create_payment_intent(
            &conn,
            &user.id,
            &PaymentIntentRequest {
                amount_minor: 9500,
                currency: "RUB".to_string(),
                description: Some("Dev donation".to_string()),
                success_return_url: None,
                fail_return_url: None,
                project_id: Some(project.id.clone()),
                referral_user_id: None,
            },
        )
        .expect("Failed to create dev payment intent");

    tracing::info!("User:    {} ({})", user.id, user.email);
    tracing::info!("Project: {} ({})", project.id, project.title);
    tracing::info!("Pending payment: {} -> {}", intent.id, intent.redirect_url);
    tracing::info!(
        "Settle it with a CloudPayments Payment webhook carrying InvoiceId={}",
        intent.id
    );
    tracing::info!("============================================");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grove=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");

    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    if cli.reconcile {
        let conn = db_pool.get().expect("Failed to get connection");
        let report = achievements::reconcile(&conn).expect("Reconciliation failed");
        println!(
            "{}",
            serde_json::to_string_pretty(&report).expect("Failed to serialize report")
        );
        return;
    }

    let state = AppState {
        db: db_pool,
        cloudpayments: CloudPaymentsClient::new(
            &config.cloudpayments_public_id,
            &config.cloudpayments_secret,
            &config.base_url,
        ),
        signature_policy: config.signature_policy,
        webhook_claim_timeout_secs: config.webhook_claim_timeout_secs,
    };

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set GROVE_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    let app = Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Grove server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
