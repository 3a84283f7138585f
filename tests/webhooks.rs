//! End-to-end webhook pipeline tests: signature, dedup, classification, settlement

mod common;

use axum::http::StatusCode;
use common::*;
use grove::error::msg;
use grove::handlers::webhooks::handle_webhook_delivery;
use serde_json::json;

/// User with a RUB price and a pending payment bound to `transaction_id`.
fn setup_payment(state: &AppState, transaction_id: &str, amount_minor: i64) -> (User, Payment) {
    let conn = state.db.get().unwrap();
    set_tree_price(&conn, Currency::Rub, RUB_TREE_PRICE);
    let user = create_test_user(&conn, &format!("{}@example.com", transaction_id));
    let payment = create_test_payment(
        &conn,
        Some(&user.id),
        transaction_id,
        amount_minor,
        Currency::Rub,
        json!({}),
    );
    (user, payment)
}

fn events_for_key(state: &AppState, key: &str) -> Vec<WebhookEvent> {
    let conn = state.db.get().unwrap();
    queries::list_webhook_events_by_key(&conn, PaymentProvider::CloudPayments, key).unwrap()
}

#[test]
fn test_signed_payment_webhook_settles() {
    let state = create_test_app_state();
    let (user, payment) = setup_payment(&state, "5001", 9_500);

    let response = deliver(&state, &payment_payload("5001", "95.00", "RUB", "Succeeded"));
    assert_eq!(response, (StatusCode::OK, msg::OK));

    let conn = state.db.get().unwrap();
    let payment = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    // 2024-05-01T10:00:00Z
    assert_eq!(payment.occurred_at, Some(1_714_557_600));

    let user = queries::get_user_by_id(&conn, &user.id).unwrap().unwrap();
    assert_eq!(user.total_trees, 5);
    assert_eq!(user.donations_count, 1);

    let events = queries::list_webhook_events_by_key(
        &conn,
        PaymentProvider::CloudPayments,
        "Payment:5001:Succeeded",
    )
    .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_claim);
    assert!(events[0].processed_ok);
    assert!(events[0].signature_ok);
    assert_eq!(events[0].event_type, "Payment");
}

#[test]
fn test_duplicate_delivery_settles_once() {
    let state = create_test_app_state();
    let (user, _) = setup_payment(&state, "5002", 9_500);
    let body = payment_payload("5002", "95.00", "RUB", "Succeeded");

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));
    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::ALREADY_PROCESSED));

    let events = events_for_key(&state, "Payment:5002:Succeeded");
    assert_eq!(events.len(), 2, "every delivery is recorded");
    assert!(events[0].is_claim);
    assert!(!events[1].is_claim);
    assert_eq!(events[1].duplicate_of.as_deref(), Some(events[0].id.as_str()));

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
    let user = queries::get_user_by_id(&conn, &user.id).unwrap().unwrap();
    assert_eq!(user.total_trees, 5);
}

#[test]
fn test_invalid_signature_is_rejected_and_recorded() {
    let state = create_test_app_state();
    let (_, payment) = setup_payment(&state, "5003", 9_500);
    let body = payment_payload("5003", "95.00", "RUB", "Succeeded");

    let forged = compute_signature(&body, "not_the_secret");
    let response = handle_webhook_delivery(&state, "cloudpayments", &body, Some(&forged));
    assert_eq!(response, (StatusCode::UNAUTHORIZED, msg::INVALID_SIGNATURE));

    {
        let conn = state.db.get().unwrap();
        let events = queries::list_webhook_events(&conn).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].signature_ok);
        assert!(!events[0].is_claim, "forged deliveries never take the claim");
        assert_eq!(events[0].processing_error.as_deref(), Some("invalid signature"));

        let payment = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(donation_count(&conn), 0);
    }

    // The genuine delivery still settles
    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));
    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
}

#[test]
fn test_missing_signature_is_rejected() {
    let state = create_test_app_state();
    setup_payment(&state, "5004", 9_500);
    let body = payment_payload("5004", "95.00", "RUB", "Succeeded");

    let response = handle_webhook_delivery(&state, "cloudpayments", &body, None);
    assert_eq!(response.0, StatusCode::UNAUTHORIZED);

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 0);
}

#[test]
fn test_flag_policy_processes_unsigned_delivery() {
    let state = create_test_app_state_with(SignaturePolicy::Flag, TEST_SECRET);
    setup_payment(&state, "5005", 9_500);
    let body = payment_payload("5005", "95.00", "RUB", "Succeeded");

    let response = handle_webhook_delivery(&state, "cloudpayments", &body, Some("00"));
    assert_eq!(response, (StatusCode::OK, msg::OK));

    let events = events_for_key(&state, "Payment:5005:Succeeded");
    assert_eq!(events.len(), 1);
    assert!(!events[0].signature_ok, "flagged, not trusted");
    assert!(events[0].processed_ok);

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
}

#[test]
fn test_empty_secret_skips_verification() {
    let state = create_test_app_state_with(SignaturePolicy::Reject, "");
    setup_payment(&state, "5006", 9_500);
    let body = payment_payload("5006", "95.00", "RUB", "Succeeded");

    let response = handle_webhook_delivery(&state, "cloudpayments", &body, None);
    assert_eq!(response, (StatusCode::OK, msg::OK));
}

#[test]
fn test_unknown_type_is_acknowledged_and_recorded() {
    let state = create_test_app_state();
    let body = json!({"Type": "Check", "TransactionId": "5007", "Status": "Completed"})
        .to_string()
        .into_bytes();

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::EVENT_NOT_PROCESSABLE));

    let events = events_for_key(&state, "Check:5007:Completed");
    assert_eq!(events.len(), 1);
    assert!(!events[0].processed_ok);
    assert!(
        events[0]
            .processing_error
            .as_deref()
            .unwrap_or_default()
            .contains("unknown webhook type")
    );
}

#[test]
fn test_malformed_body_is_recorded_as_unparseable() {
    let state = create_test_app_state();

    assert_eq!(deliver(&state, b"not json"), (StatusCode::OK, msg::EVENT_NOT_PROCESSABLE));

    let conn = state.db.get().unwrap();
    let events = queries::list_webhook_events(&conn).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "unparseable");
    assert!(events[0].idempotency_key.is_none());
    assert!(events[0].processing_error.is_some());
    assert_eq!(events[0].raw_payload, "not json");
}

#[test]
fn test_missing_transaction_id_is_recorded_without_claim() {
    let state = create_test_app_state();
    let body = json!({"Type": "Payment", "Status": "Succeeded", "Amount": 95, "Currency": "RUB"})
        .to_string()
        .into_bytes();

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::EVENT_NOT_PROCESSABLE));

    let conn = state.db.get().unwrap();
    let events = queries::list_webhook_events(&conn).unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_claim);
    assert_eq!(
        events[0].processing_error.as_deref(),
        Some("missing field: TransactionId")
    );
}

#[test]
fn test_unknown_payment_fails_then_retry_succeeds() {
    let state = create_test_app_state();
    let body = payment_payload("5008", "95.00", "RUB", "Succeeded");

    assert_eq!(
        deliver(&state, &body),
        (StatusCode::INTERNAL_SERVER_ERROR, msg::PAYMENT_NOT_FOUND)
    );
    let events = events_for_key(&state, "Payment:5008:Succeeded");
    assert_eq!(events.len(), 1);
    assert!(!events[0].processed_ok);
    assert!(events[0].processing_error.is_some());

    setup_payment(&state, "5008", 9_500);

    // The failed claim is retaken rather than treated as a duplicate
    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));
    let events = events_for_key(&state, "Payment:5008:Succeeded");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempts, 2);
    assert!(events[0].processed_ok);
    assert!(events[0].processing_error.is_none());
}

#[test]
fn test_missing_price_fails_without_side_effects() {
    let state = create_test_app_state();
    let payment = {
        let conn = state.db.get().unwrap();
        let user = create_test_user(&conn, "eur@example.com");
        create_test_payment(&conn, Some(&user.id), "5009", 4_600, Currency::Eur, json!({}))
    };
    let body = payment_payload("5009", "46.00", "EUR", "Succeeded");

    assert_eq!(
        deliver(&state, &body),
        (StatusCode::INTERNAL_SERVER_ERROR, msg::PRICE_NOT_CONFIGURED)
    );
    {
        let conn = state.db.get().unwrap();
        let stored = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(donation_count(&conn), 0);
        set_tree_price(&conn, Currency::Eur, 2_300);
    }

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));
    let conn = state.db.get().unwrap();
    let donation = queries::get_donation_by_payment(&conn, &payment.id).unwrap().unwrap();
    assert_eq!(donation.trees_count, 2);
}

#[test]
fn test_decline_then_success_for_same_transaction() {
    let state = create_test_app_state();
    let (_, payment) = setup_payment(&state, "5010", 9_500);

    let declined = payment_payload("5010", "95.00", "RUB", "Declined");
    assert_eq!(deliver(&state, &declined), (StatusCode::OK, msg::OK));
    {
        let conn = state.db.get().unwrap();
        let stored = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(donation_count(&conn), 0);
    }

    let succeeded = payment_payload("5010", "95.00", "RUB", "Succeeded");
    assert_eq!(deliver(&state, &succeeded), (StatusCode::OK, msg::OK));

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
    assert_eq!(webhook_event_count(&conn), 2);
}

#[test]
fn test_refund_after_payment() {
    let state = create_test_app_state();
    let (user, payment) = setup_payment(&state, "5011", 9_500);

    assert_eq!(
        deliver(&state, &payment_payload("5011", "95.00", "RUB", "Succeeded")),
        (StatusCode::OK, msg::OK)
    );
    let refund = refund_payload("5011", Some("duplicate charge"));
    assert_eq!(deliver(&state, &refund), (StatusCode::OK, msg::OK));
    assert_eq!(deliver(&state, &refund), (StatusCode::OK, msg::ALREADY_PROCESSED));

    let conn = state.db.get().unwrap();
    let payment = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(payment.meta["refund_reason"], "duplicate charge");

    assert_eq!(payment.occurred_at, Some(1_714_644_000), "refund time is recorded");
    assert_eq!(payment.meta["charged_at"], 1_714_557_600);

    let user = queries::get_user_by_id(&conn, &user.id).unwrap().unwrap();
    assert_eq!(user.total_trees, 5);
    assert_eq!(donation_count(&conn), 1);
}

#[test]
fn test_refund_delivered_before_success() {
    let state = create_test_app_state();
    let (user, payment) = setup_payment(&state, "5013", 9_500);

    assert_eq!(deliver(&state, &refund_payload("5013", None)), (StatusCode::OK, msg::OK));
    assert_eq!(
        deliver(&state, &payment_payload("5013", "95.00", "RUB", "Succeeded")),
        (StatusCode::OK, msg::OK)
    );

    let conn = state.db.get().unwrap();
    let payment = queries::get_payment_by_id(&conn, &payment.id).unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(donation_count(&conn), 0);
    let user = queries::get_user_by_id(&conn, &user.id).unwrap().unwrap();
    assert_eq!(user.total_trees, 0);
    assert_eq!(user.donations_count, 0);
    drop(conn);

    let events = events_for_key(&state, "Payment:5013:Succeeded");
    assert_eq!(events.len(), 1);
    assert!(events[0].processed_ok);
}

#[test]
fn test_subscription_charge_webhook() {
    let state = create_test_app_state();
    let subscription = {
        let conn = state.db.get().unwrap();
        set_tree_price(&conn, Currency::Rub, RUB_TREE_PRICE);
        let user = create_test_user(&conn, "monthly@example.com");
        create_test_subscription(&conn, &user.id, "sc_100", 3_800, Currency::Rub, json!({}))
    };

    let body = subscription_charge_payload("6001", "sc_100", "38.00", "RUB");
    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));

    let conn = state.db.get().unwrap();
    let subscription = queries::get_subscription_by_id(&conn, &subscription.id)
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    let payments = queries::list_payments_for_subscription(&conn, &subscription.id).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount_minor, 3_800);
}

#[test]
fn test_subscription_charge_without_amount_is_not_processable() {
    let state = create_test_app_state();
    let body = json!({
        "Type": "SubscriptionCharge",
        "TransactionId": "6002",
        "SubscriptionId": "sc_101",
        "Status": "Succeeded",
    })
    .to_string()
    .into_bytes();

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::EVENT_NOT_PROCESSABLE));
    let events = events_for_key(&state, "SubscriptionCharge:6002:Succeeded");
    assert_eq!(events[0].processing_error.as_deref(), Some("missing field: Amount"));
}

#[test]
fn test_in_flight_claim_blocks_until_stale() {
    let state = create_test_app_state();
    setup_payment(&state, "5012", 9_500);
    let body = payment_payload("5012", "95.00", "RUB", "Succeeded");
    let key = "Payment:5012:Succeeded";

    // Simulate a worker that took the claim and died
    let claim_id = {
        let mut conn = state.db.get().unwrap();
        let outcome = queries::try_claim_webhook_event(
            &mut conn,
            &NewWebhookEvent {
                provider: PaymentProvider::CloudPayments,
                event_type: "Payment".to_string(),
                idempotency_key: Some(key.to_string()),
                raw_payload: String::from_utf8(body.clone()).unwrap(),
                signature_ok: true,
            },
            0,
        )
        .unwrap();
        match outcome {
            ClaimOutcome::Claimed { event_id } => event_id,
            other => panic!("expected claim, got {:?}", other),
        }
    };

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::ALREADY_PROCESSED));
    {
        let conn = state.db.get().unwrap();
        assert_eq!(donation_count(&conn), 0);
        conn.execute(
            "UPDATE webhook_events SET claimed_at = claimed_at - 3600 WHERE id = ?1",
            [&claim_id],
        )
        .unwrap();
    }

    assert_eq!(deliver(&state, &body), (StatusCode::OK, msg::OK));
    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
    let claim = queries::get_webhook_event(&conn, &claim_id).unwrap().unwrap();
    assert!(claim.processed_ok);
    assert_eq!(claim.attempts, 2);
}

#[test]
fn test_unsupported_provider() {
    let state = create_test_app_state();
    let body = payment_payload("5013", "95.00", "RUB", "Succeeded");

    for provider in ["kaspi", "stripe", ""] {
        let response = handle_webhook_delivery(&state, provider, &body, None);
        assert_eq!(response, (StatusCode::NOT_FOUND, msg::UNSUPPORTED_PROVIDER));
    }

    let conn = state.db.get().unwrap();
    assert_eq!(webhook_event_count(&conn), 0);
}

#[test]
fn test_provider_name_is_case_insensitive() {
    let state = create_test_app_state();
    setup_payment(&state, "5014", 9_500);
    let body = payment_payload("5014", "95.00", "RUB", "Succeeded");
    let signature = compute_signature(&body, TEST_SECRET);

    let response = handle_webhook_delivery(&state, "CloudPayments", &body, Some(&signature));
    assert_eq!(response, (StatusCode::OK, msg::OK));
}
