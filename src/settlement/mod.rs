//! Settlement engine: turns a classified provider event into payment state,
//! donations and counter updates.
//!
//! Every state change for one event commits in a single IMMEDIATE
//! transaction together with `processed_ok` on the webhook claim row, so a
//! failure anywhere leaves no partial effects and the claim retryable.
//! Achievement evaluation runs after commit and never fails settlement.

mod events;

pub use events::*;

use rusqlite::{Connection, TransactionBehavior};
use serde_json::{Value, json};
use thiserror::Error;

use crate::achievements;
use crate::db::queries;
use crate::error::{AppError, msg};
use crate::id::is_valid_prefixed_id;
use crate::models::{
    CreatePayment, Currency, Donation, Payment, PaymentProvider, PaymentStatus, Subscription,
};

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("no payment for transaction {0}")]
    PaymentNotFound(String),

    #[error("no subscription for {0}")]
    SubscriptionNotFound(String),

    #[error("tree price not configured for {0}")]
    PriceNotConfigured(Currency),

    #[error("payment {0} has no owner")]
    MissingOwner(String),

    #[error("{0}")]
    Input(#[from] ClassifyError),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        SettlementError::Storage(AppError::Database(e))
    }
}

impl SettlementError {
    /// Bounded message safe to return to the provider.
    pub fn public_message(&self) -> &'static str {
        match self {
            SettlementError::PaymentNotFound(_) => msg::PAYMENT_NOT_FOUND,
            SettlementError::SubscriptionNotFound(_) => msg::SUBSCRIPTION_NOT_FOUND,
            SettlementError::PriceNotConfigured(_) => msg::PRICE_NOT_CONFIGURED,
            SettlementError::MissingOwner(_) => msg::PAYMENT_HAS_NO_OWNER,
            SettlementError::Input(_) => msg::EVENT_NOT_PROCESSABLE,
            SettlementError::Storage(_) => msg::DATABASE_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// Payment succeeded and a donation was recorded.
    Settled {
        payment_id: String,
        donation: Donation,
        total_trees: i64,
        /// Codes of achievements granted by this settlement.
        achievements: Vec<String>,
    },
    Refunded {
        payment_id: String,
    },
    /// The provider reported a non-success status; nothing to settle yet.
    Skipped {
        status: String,
    },
    /// The payment already has its donation.
    AlreadySettled {
        payment_id: String,
    },
    /// The payment was refunded or canceled before this charge arrived.
    /// Terminal states are never moved back to succeeded.
    Closed {
        payment_id: String,
        status: PaymentStatus,
    },
}

/// Apply `event` and mark the webhook claim `webhook_event_id` processed.
pub fn settle(
    conn: &mut Connection,
    webhook_event_id: &str,
    provider: PaymentProvider,
    event: &ProviderEvent,
) -> Result<SettlementOutcome, SettlementError> {
    let now = queries::now();

    let mut outcome = {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = match event {
            ProviderEvent::Payment(data) => settle_payment(&tx, provider, data, now)?,
            ProviderEvent::SubscriptionCharge(data) => {
                settle_subscription_charge(&tx, provider, data, now)?
            }
            ProviderEvent::Refund(data) => settle_refund(&tx, provider, data, now)?,
        };
        queries::mark_webhook_processed(&tx, webhook_event_id)?;
        tx.commit()?;
        outcome
    };

    if let SettlementOutcome::Settled {
        donation,
        total_trees,
        achievements: granted_codes,
        ..
    } = &mut outcome
    {
        match achievements::evaluate(conn, &donation.user_id, *total_trees) {
            Ok(granted) => *granted_codes = granted.into_iter().map(|a| a.code).collect(),
            Err(e) => tracing::warn!(
                "Achievement evaluation failed for user {}: {}",
                donation.user_id,
                e
            ),
        }
    }

    Ok(outcome)
}

fn settle_payment(
    conn: &Connection,
    provider: PaymentProvider,
    data: &ChargeData,
    now: i64,
) -> Result<SettlementOutcome, SettlementError> {
    if !data.is_succeeded() {
        tracing::info!(
            "Payment {} reported status {}, nothing to settle",
            data.transaction_id,
            data.status
        );
        return Ok(SettlementOutcome::Skipped {
            status: data.status.clone(),
        });
    }

    let payment = find_payment(conn, provider, &data.transaction_id, data.invoice_id.as_deref())?
        .ok_or_else(|| SettlementError::PaymentNotFound(data.transaction_id.clone()))?;

    if let Some(outcome) = closed_outcome(&payment, &data.transaction_id) {
        return Ok(outcome);
    }

    if queries::get_donation_by_payment(conn, &payment.id)?.is_some() {
        tracing::info!("Payment {} already settled", payment.id);
        return Ok(SettlementOutcome::AlreadySettled {
            payment_id: payment.id,
        });
    }

    if let Some(owner) = payment.user_id.as_deref() {
        if let Some(account_id) = data.account_id.as_deref().filter(|a| *a != owner) {
            tracing::warn!(
                "Payment {} owner mismatch: stored {}, provider reported account {}",
                payment.id,
                owner,
                account_id
            );
        }
    }
    if data.amount_minor.is_some_and(|amount| amount != payment.amount_minor) {
        tracing::warn!(
            "Payment {} amount mismatch: stored {}, provider reported {}",
            payment.id,
            payment.amount_minor,
            data.amount_minor.unwrap_or_default()
        );
    }
    if let Some(currency) = data.currency.filter(|c| *c != payment.currency) {
        tracing::warn!(
            "Payment {} currency mismatch: stored {}, provider reported {}",
            payment.id,
            payment.currency,
            currency
        );
    }

    let payment = mark_succeeded(conn, payment, data.occurred_at.unwrap_or(now))?;
    let (donation, total_trees) = record_donation(conn, &payment, now)?;

    Ok(SettlementOutcome::Settled {
        payment_id: payment.id,
        donation,
        total_trees,
        achievements: Vec::new(),
    })
}

fn settle_subscription_charge(
    conn: &Connection,
    provider: PaymentProvider,
    data: &SubscriptionChargeData,
    now: i64,
) -> Result<SettlementOutcome, SettlementError> {
    let charge = &data.charge;
    if !charge.is_succeeded() {
        tracing::info!(
            "Subscription {} charge {} reported status {}, nothing to settle",
            data.subscription_id,
            charge.transaction_id,
            charge.status
        );
        return Ok(SettlementOutcome::Skipped {
            status: charge.status.clone(),
        });
    }

    let existing = queries::get_payment_by_provider_id(conn, provider, &charge.transaction_id)?;
    if let Some(payment) = &existing {
        if let Some(outcome) = closed_outcome(payment, &charge.transaction_id) {
            return Ok(outcome);
        }
        if queries::get_donation_by_payment(conn, &payment.id)?.is_some() {
            tracing::info!("Subscription charge {} already settled", charge.transaction_id);
            return Ok(SettlementOutcome::AlreadySettled {
                payment_id: payment.id.clone(),
            });
        }
    }

    let subscription = find_subscription(
        conn,
        provider,
        &data.subscription_id,
        charge.invoice_id.as_deref(),
    )?
    .ok_or_else(|| SettlementError::SubscriptionNotFound(data.subscription_id.clone()))?;

    let occurred_at = charge.occurred_at.unwrap_or(now);
    let payment = match existing {
        Some(payment) => mark_succeeded(conn, payment, occurred_at)?,
        None => {
            let amount_minor = charge
                .amount_minor
                .ok_or(ClassifyError::MissingField("Amount"))?;
            let currency = charge.currency.ok_or(ClassifyError::MissingField("Currency"))?;

            let mut meta = json!({
                "subscription_charge": true,
                "webhook_processed": true,
            });
            for key in ["project_id", "referral_user_id"] {
                if let Some(v) = subscription.meta.get(key).filter(|v| !v.is_null()) {
                    meta[key] = v.clone();
                }
            }

            queries::create_payment(
                conn,
                &CreatePayment {
                    provider,
                    provider_payment_id: Some(charge.transaction_id.clone()),
                    user_id: Some(subscription.user_id.clone()),
                    subscription_id: Some(subscription.id.clone()),
                    amount_minor,
                    currency,
                    status: PaymentStatus::Succeeded,
                    occurred_at: Some(occurred_at),
                    meta,
                },
            )?
        }
    };

    if subscription.status.activates_on_charge() {
        queries::activate_subscription(conn, &subscription.id, occurred_at)?;
        tracing::info!("Subscription {} is now active", subscription.id);
    }

    let (donation, total_trees) = record_donation(conn, &payment, now)?;

    Ok(SettlementOutcome::Settled {
        payment_id: payment.id,
        donation,
        total_trees,
        achievements: Vec::new(),
    })
}

// Refunds leave donations, counters and achievements untouched.
fn settle_refund(
    conn: &Connection,
    provider: PaymentProvider,
    data: &RefundData,
    now: i64,
) -> Result<SettlementOutcome, SettlementError> {
    let payment = queries::get_payment_by_provider_id(conn, provider, &data.transaction_id)?
        .ok_or_else(|| SettlementError::PaymentNotFound(data.transaction_id.clone()))?;

    let refunded_at = data.occurred_at.unwrap_or(now);
    let mut patch = json!({
        "webhook_processed": true,
        "refunded_at": refunded_at,
    });
    // Keep the charge time; occurred_at becomes the refund time
    if payment.meta.get("charged_at").is_none() {
        if let Some(charged_at) = payment.occurred_at {
            patch["charged_at"] = json!(charged_at);
        }
    }
    if let Some(reason) = &data.reason {
        patch["refund_reason"] = Value::String(reason.clone());
    }
    let meta = merge_meta(&payment.meta, patch);

    queries::update_payment_status(
        conn,
        &payment.id,
        PaymentStatus::Refunded,
        refunded_at,
        &meta,
    )?;

    tracing::info!(
        "Payment {} refunded{}",
        payment.id,
        data.reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );

    Ok(SettlementOutcome::Refunded {
        payment_id: payment.id,
    })
}

/// Look a payment up by provider transaction id, falling back to binding the
/// transaction to the pending payment named by `invoice_id`.
fn find_payment(
    conn: &Connection,
    provider: PaymentProvider,
    transaction_id: &str,
    invoice_id: Option<&str>,
) -> Result<Option<Payment>, SettlementError> {
    if let Some(payment) = queries::get_payment_by_provider_id(conn, provider, transaction_id)? {
        return Ok(Some(payment));
    }
    let Some(invoice_id) = invoice_id.filter(|id| is_valid_prefixed_id(id)) else {
        return Ok(None);
    };
    let bound = queries::bind_payment_provider_id(conn, invoice_id, provider, transaction_id)?;
    if let Some(payment) = &bound {
        tracing::info!("Bound transaction {} to payment {}", transaction_id, payment.id);
    }
    Ok(bound)
}

fn find_subscription(
    conn: &Connection,
    provider: PaymentProvider,
    provider_subscription_id: &str,
    invoice_id: Option<&str>,
) -> Result<Option<Subscription>, SettlementError> {
    if let Some(subscription) =
        queries::get_subscription_by_provider_id(conn, provider, provider_subscription_id)?
    {
        return Ok(Some(subscription));
    }
    let Some(invoice_id) = invoice_id.filter(|id| is_valid_prefixed_id(id)) else {
        return Ok(None);
    };
    let bound =
        queries::bind_subscription_provider_id(conn, invoice_id, provider, provider_subscription_id)?;
    if let Some(subscription) = &bound {
        tracing::info!(
            "Bound provider subscription {} to {}",
            provider_subscription_id,
            subscription.id
        );
    }
    Ok(bound)
}

/// Outcome for a charge that arrives after the payment reached a terminal state.
fn closed_outcome(payment: &Payment, transaction_id: &str) -> Option<SettlementOutcome> {
    if !matches!(payment.status, PaymentStatus::Refunded | PaymentStatus::Canceled) {
        return None;
    }
    tracing::warn!(
        "Ignoring success for transaction {}: payment {} is already {}",
        transaction_id,
        payment.id,
        payment.status.as_ref()
    );
    Some(SettlementOutcome::Closed {
        payment_id: payment.id.clone(),
        status: payment.status,
    })
}

fn mark_succeeded(
    conn: &Connection,
    payment: Payment,
    occurred_at: i64,
) -> Result<Payment, SettlementError> {
    let meta = merge_meta(&payment.meta, json!({ "webhook_processed": true }));
    queries::update_payment_status(conn, &payment.id, PaymentStatus::Succeeded, occurred_at, &meta)?;
    Ok(Payment {
        status: PaymentStatus::Succeeded,
        occurred_at: Some(occurred_at),
        meta,
        ..payment
    })
}

/// Insert the donation for a succeeded payment and bump the owner's counters.
/// Returns the donation and the owner's new tree total.
fn record_donation(
    conn: &Connection,
    payment: &Payment,
    now: i64,
) -> Result<(Donation, i64), SettlementError> {
    let price = queries::get_tree_price(conn, payment.currency)?
        .ok_or(SettlementError::PriceNotConfigured(payment.currency))?;
    let user_id = payment
        .user_id
        .as_deref()
        .ok_or_else(|| SettlementError::MissingOwner(payment.id.clone()))?;

    let trees = price.trees_for(payment.amount_minor);
    let project_id = donation_project(conn, payment)?;
    let referral_user_id = donation_referral(conn, payment, user_id)?;

    let donation = queries::create_donation(
        conn,
        user_id,
        &payment.id,
        project_id.as_deref(),
        referral_user_id.as_deref(),
        trees,
        now,
    )?;
    let total_trees = queries::increment_user_counters(conn, user_id, trees, now)?
        .ok_or_else(|| SettlementError::MissingOwner(payment.id.clone()))?;

    tracing::info!(
        "Payment {} settled: {} tree(s) for user {} (total {})",
        payment.id,
        trees,
        user_id,
        total_trees
    );

    Ok((donation, total_trees))
}

/// Project from payment metadata, if it names one that exists.
fn donation_project(conn: &Connection, payment: &Payment) -> Result<Option<String>, SettlementError> {
    let Some(project_id) = payment.meta_str("project_id") else {
        return Ok(None);
    };
    if queries::get_project_by_id(conn, project_id)?.is_some() {
        Ok(Some(project_id.to_string()))
    } else {
        tracing::debug!("Payment {} names unknown project {}", payment.id, project_id);
        Ok(None)
    }
}

/// Referrer from payment metadata: an existing user other than the donor.
fn donation_referral(
    conn: &Connection,
    payment: &Payment,
    donor_id: &str,
) -> Result<Option<String>, SettlementError> {
    let Some(referrer) = payment
        .meta_str("referral_user_id")
        .filter(|r| *r != donor_id)
    else {
        return Ok(None);
    };
    if queries::user_exists(conn, referrer)? {
        Ok(Some(referrer.to_string()))
    } else {
        Ok(None)
    }
}

/// Shallow-merge `patch` into a metadata object.
fn merge_meta(base: &Value, patch: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(patch) = patch {
        merged.extend(patch);
    }
    Value::Object(merged)
}
