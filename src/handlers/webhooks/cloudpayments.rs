use axum::http::HeaderMap;

use crate::models::{Currency, PaymentProvider};
use crate::payments::{
    CloudPaymentsClient, CloudPaymentsNotification, parse_occurred_at, to_minor_units,
};
use crate::settlement::{
    ChargeData, ClassifyError, ParsedDelivery, ProviderEvent, RefundData, SubscriptionChargeData,
};

use super::common::WebhookProvider;

pub struct CloudPaymentsWebhook {
    client: CloudPaymentsClient,
}

impl CloudPaymentsWebhook {
    pub fn new(client: CloudPaymentsClient) -> Self {
        Self { client }
    }
}

impl WebhookProvider for CloudPaymentsWebhook {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::CloudPayments
    }

    fn extract_signature(&self, headers: &HeaderMap) -> Option<String> {
        [
            CloudPaymentsClient::SIGNATURE_HEADER,
            CloudPaymentsClient::SIGNATURE_HEADER_FALLBACK,
        ]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    }

    fn verify_signature(&self, body: &[u8], signature: &str) -> bool {
        self.client.verify_webhook_signature(body, signature)
    }

    fn parse_delivery(&self, body: &[u8]) -> Result<ParsedDelivery, ClassifyError> {
        let notification = CloudPaymentsNotification::from_slice(body)?;
        Ok(classify_notification(&notification))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Classify a notification and derive its idempotency key.
///
/// The key is `{Type}:{TransactionId}:{Status}`: a refund is not a duplicate
/// of the payment it refunds, and a later success is not a duplicate of an
/// earlier decline for the same transaction.
pub fn classify_notification(notification: &CloudPaymentsNotification) -> ParsedDelivery {
    let event_type = non_empty(&notification.event_type).unwrap_or("unknown");
    let idempotency_key = non_empty(&notification.transaction_id).map(|tx| {
        format!(
            "{}:{}:{}",
            event_type,
            tx,
            non_empty(&notification.status).unwrap_or_default()
        )
    });

    ParsedDelivery {
        event_type: event_type.to_string(),
        idempotency_key,
        event: classify(notification),
    }
}

fn classify(n: &CloudPaymentsNotification) -> Result<ProviderEvent, ClassifyError> {
    let event_type = non_empty(&n.event_type).ok_or(ClassifyError::MissingField("Type"))?;

    match event_type {
        "Payment" => Ok(ProviderEvent::Payment(charge_data(n)?)),
        "SubscriptionCharge" => {
            let subscription_id = non_empty(&n.subscription_id)
                .ok_or(ClassifyError::MissingField("SubscriptionId"))?;
            let charge = charge_data(n)?;
            // A successful charge creates a payment, so it must say how much
            if charge.is_succeeded() {
                charge.amount_minor.ok_or(ClassifyError::MissingField("Amount"))?;
                charge.currency.ok_or(ClassifyError::MissingField("Currency"))?;
            }
            Ok(ProviderEvent::SubscriptionCharge(SubscriptionChargeData {
                subscription_id: subscription_id.to_string(),
                charge,
            }))
        }
        "Refund" => {
            let transaction_id = non_empty(&n.transaction_id)
                .ok_or(ClassifyError::MissingField("TransactionId"))?;
            let (amount_minor, currency) = amount_and_currency(n)?;
            Ok(ProviderEvent::Refund(RefundData {
                transaction_id: transaction_id.to_string(),
                amount_minor,
                currency,
                occurred_at: occurred_at(n)?,
                reason: non_empty(&n.reason).map(String::from),
            }))
        }
        other => Err(ClassifyError::UnknownType(other.to_string())),
    }
}

fn charge_data(n: &CloudPaymentsNotification) -> Result<ChargeData, ClassifyError> {
    let transaction_id =
        non_empty(&n.transaction_id).ok_or(ClassifyError::MissingField("TransactionId"))?;
    let (amount_minor, currency) = amount_and_currency(n)?;

    Ok(ChargeData {
        transaction_id: transaction_id.to_string(),
        amount_minor,
        currency,
        status: non_empty(&n.status).unwrap_or_default().to_string(),
        occurred_at: occurred_at(n)?,
        invoice_id: non_empty(&n.invoice_id).map(String::from),
        account_id: non_empty(&n.account_id).map(String::from),
    })
}

fn amount_and_currency(
    n: &CloudPaymentsNotification,
) -> Result<(Option<i64>, Option<Currency>), ClassifyError> {
    let currency = non_empty(&n.currency)
        .map(|code| {
            code.parse::<Currency>()
                .map_err(|_| ClassifyError::UnsupportedCurrency(code.to_string()))
        })
        .transpose()?;

    let amount_minor = match non_empty(&n.amount) {
        None => None,
        Some(amount) => {
            let currency = currency.ok_or(ClassifyError::MissingField("Currency"))?;
            Some(to_minor_units(amount, currency)?)
        }
    };

    Ok((amount_minor, currency))
}

fn occurred_at(n: &CloudPaymentsNotification) -> Result<Option<i64>, ClassifyError> {
    non_empty(&n.occurred_at).map(parse_occurred_at).transpose()
}
