pub mod cloudpayments;
pub mod common;

pub use cloudpayments::CloudPaymentsWebhook;
pub use common::{WebhookProvider, WebhookResult, handle_webhook};

use std::str::FromStr;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};

use crate::db::AppState;
use crate::error::msg;
use crate::models::PaymentProvider;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/{provider}", post(handle_provider_webhook))
}

/// Webhook implementation for a provider name, if that provider takes webhooks.
fn resolve_provider(state: &AppState, name: &str) -> Option<Box<dyn WebhookProvider>> {
    match PaymentProvider::from_str(name).ok()? {
        PaymentProvider::CloudPayments => {
            Some(Box::new(CloudPaymentsWebhook::new(state.cloudpayments.clone())))
        }
        PaymentProvider::Kaspi | PaymentProvider::PayPal | PaymentProvider::Tribute => None,
    }
}

/// POST /webhooks/{provider}
pub async fn handle_provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(webhook) = resolve_provider(&state, &provider) else {
        tracing::warn!("Webhook for unsupported provider: {}", provider);
        return (StatusCode::NOT_FOUND, msg::UNSUPPORTED_PROVIDER);
    };
    let signature = webhook.extract_signature(&headers);
    handle_webhook(webhook.as_ref(), &state, &body, signature.as_deref())
}

/// Process one delivery addressed to `provider_name`. Returns the HTTP status
/// and a bounded public message.
pub fn handle_webhook_delivery(
    state: &AppState,
    provider_name: &str,
    body: &[u8],
    signature: Option<&str>,
) -> WebhookResult {
    match resolve_provider(state, provider_name) {
        Some(webhook) => handle_webhook(webhook.as_ref(), state, body, signature),
        None => (StatusCode::NOT_FOUND, msg::UNSUPPORTED_PROVIDER),
    }
}
