//! Integration tests for RevenueCat webhook processing
//!
//! Covers dedup by event id, user resolution through aliases, subscription state
//! transitions, and idempotency shared with client purchase submissions.

#![allow(clippy::unwrap_used)]

mod support;

use creditline_billing::{BillingError, LedgerStore, PurchaseClaim, WebhookEvent, WebhookRequest};
use creditline_shared::{CreditTransactionType, SubscriptionStatus};
use support::Harness;

fn request(event: WebhookEvent) -> Option<WebhookRequest> {
    Some(WebhookRequest {
        event: Some(event),
        api_version: Some("1.0".to_string()),
    })
}

fn purchase_event(id: &str, app_user_id: &str, transaction_id: &str) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        event_type: "NON_RENEWING_PURCHASE".to_string(),
        app_user_id: Some(app_user_id.to_string()),
        product_id: Some("com.example.credits_100".to_string()),
        transaction_id: Some(transaction_id.to_string()),
        ..WebhookEvent::default()
    }
}

fn lifecycle_event(id: &str, kind: &str, app_user_id: &str) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        event_type: kind.to_string(),
        app_user_id: Some(app_user_id.to_string()),
        product_id: Some("com.example.pro_monthly".to_string()),
        expiration_at_ms: Some(4_102_444_800_000),
        ..WebhookEvent::default()
    }
}

#[tokio::test]
async fn test_purchase_event_credits_and_replay_is_skipped() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user();
    let event = purchase_event("evt-1", &user_id.to_string(), "T1");

    let first = h.services.webhooks.process(request(event.clone())).await.unwrap();
    assert!(first.processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);

    let replay = h.services.webhooks.process(request(event)).await.unwrap();
    assert!(!replay.processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);
    assert_eq!(h.store.transactions_for(user_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_client_then_webhook_credits_once() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user();
    h.history
        .add_purchase(&user_id.to_string(), "com.example.credits_100", "T1", 1_000);

    let outcome = h
        .services
        .reconciler
        .grant_from_verified_purchase(
            user_id,
            &PurchaseClaim {
                product_id: "com.example.credits_100".to_string(),
                transaction_id: Some("T1".to_string()),
                app_user_id: None,
            },
        )
        .await
        .unwrap();
    assert!(outcome.success);

    let webhook = h
        .services
        .webhooks
        .process(request(purchase_event("evt-1", &user_id.to_string(), "T1")))
        .await
        .unwrap();
    assert!(webhook.processed);

    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);
    assert_eq!(h.store.transactions_for(user_id).unwrap().len(), 1);
    assert!(h.store.webhook_event_exists("evt-1").await.unwrap());
}

#[tokio::test]
async fn test_webhook_then_client_reports_already_processed() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user();
    h.history
        .add_purchase(&user_id.to_string(), "com.example.credits_100", "T1", 1_000);

    h.services
        .webhooks
        .process(request(purchase_event("evt-1", &user_id.to_string(), "T1")))
        .await
        .unwrap();

    let outcome = h
        .services
        .reconciler
        .grant_from_verified_purchase(
            user_id,
            &PurchaseClaim {
                product_id: "com.example.credits_100".to_string(),
                transaction_id: None,
                app_user_id: None,
            },
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.already_processed);
    assert_eq!(outcome.new_balance, 120);
}

#[tokio::test]
async fn test_alias_resolves_linked_user() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user_with(|u| u.billing_customer_id = Some("$RCAnonymousID:123".into()));

    let event = WebhookEvent {
        app_user_id: Some("$RCAnonymousID:999".to_string()),
        aliases: Some(vec![
            "$RCAnonymousID:999".to_string(),
            "$RCAnonymousID:123".to_string(),
        ]),
        ..purchase_event("evt-alias", "ignored", "T1")
    };

    let outcome = h.services.webhooks.process(request(event)).await.unwrap();
    assert!(outcome.processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);

    // Existing link is kept
    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.customer_id.as_deref(), Some("$RCAnonymousID:123"));
    assert_eq!(view.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_internal_id_alias_links_anonymous_id() {
    let h = Harness::new();
    let user_id = h.user();

    let event = WebhookEvent {
        aliases: Some(vec!["$RCAnonymousID:abc".to_string(), user_id.to_string()]),
        ..lifecycle_event("evt-1", "RENEWAL", "$RCAnonymousID:abc")
    };
    let outcome = h.services.webhooks.process(request(event)).await.unwrap();
    assert!(outcome.processed);

    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.customer_id.as_deref(), Some("$RCAnonymousID:abc"));
    assert!(view.is_active);
    // No package for the subscription product, so no credits
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 10);
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let h = Harness::new();
    let user_id = h.user();
    let app_user = user_id.to_string();
    let webhooks = &h.services.webhooks;

    let steps = [
        ("INITIAL_PURCHASE", SubscriptionStatus::Active),
        ("CANCELLATION", SubscriptionStatus::Cancelled),
        ("UNCANCELLATION", SubscriptionStatus::Active),
        ("SUBSCRIPTION_PAUSED", SubscriptionStatus::Paused),
        ("RENEWAL", SubscriptionStatus::Active),
        ("EXPIRATION", SubscriptionStatus::Expired),
    ];
    for (i, (kind, expected)) in steps.iter().enumerate() {
        let event = lifecycle_event(&format!("evt-{i}"), kind, &app_user);
        assert!(webhooks.process(request(event)).await.unwrap().processed);
        let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
        assert_eq!(view.status, *expected, "after {kind}");
    }

    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.product_id.as_deref(), Some("com.example.pro_monthly"));
    assert!(!view.is_active);
}

#[tokio::test]
async fn test_cancellation_keeps_credits() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user();
    let webhooks = &h.services.webhooks;

    webhooks
        .process(request(purchase_event("evt-1", &user_id.to_string(), "T1")))
        .await
        .unwrap();
    webhooks
        .process(request(lifecycle_event("evt-2", "CANCELLATION", &user_id.to_string())))
        .await
        .unwrap();

    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);
    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn test_product_change_updates_product_only() {
    let h = Harness::new();
    let user_id = h.user();
    let webhooks = &h.services.webhooks;

    webhooks
        .process(request(lifecycle_event("evt-1", "CANCELLATION", &user_id.to_string())))
        .await
        .unwrap();
    let event = WebhookEvent {
        new_product_id: Some("com.example.pro_annual".to_string()),
        ..lifecycle_event("evt-2", "PRODUCT_CHANGE", &user_id.to_string())
    };
    webhooks.process(request(event)).await.unwrap();

    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.status, SubscriptionStatus::Cancelled);
    assert_eq!(view.product_id.as_deref(), Some("com.example.pro_annual"));
    assert!(view.expires_at.is_some());
}

#[tokio::test]
async fn test_refund_reversed_regrants_credited_purchase() {
    let h = Harness::new();
    h.hundred_pack();
    let user_id = h.user();
    let webhooks = &h.services.webhooks;

    let purchase = purchase_event("evt-buy", &user_id.to_string(), "T1");
    assert!(webhooks.process(request(purchase)).await.unwrap().processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 120);

    webhooks
        .process(request(lifecycle_event("evt-cancel", "CANCELLATION", &user_id.to_string())))
        .await
        .unwrap();

    // The reversal names the same transaction as the original purchase
    let reversal = WebhookEvent {
        event_type: "REFUND_REVERSED".to_string(),
        ..purchase_event("evt-rr", &user_id.to_string(), "T1")
    };
    assert!(webhooks.process(request(reversal.clone())).await.unwrap().processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 230);

    let rows = h.store.transactions_for(user_id).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, CreditTransactionType::Purchase);
    assert_eq!(rows[1].kind, CreditTransactionType::RefundReversal);
    assert_eq!(rows[1].amount, 110);
    assert_eq!(rows[1].balance_after, 230);

    // Redelivery of the reversal is skipped
    assert!(!webhooks.process(request(reversal)).await.unwrap().processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 230);
    assert_eq!(h.store.transactions_for(user_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_and_test_events_are_acknowledged() {
    let h = Harness::new();

    for (id, kind) in [("evt-test", "TEST"), ("evt-new", "SUBSCRIBER_ALIAS_V9")] {
        let event = WebhookEvent {
            id: id.to_string(),
            event_type: kind.to_string(),
            app_user_id: Some("nobody".to_string()),
            ..WebhookEvent::default()
        };
        let outcome = h.services.webhooks.process(request(event.clone())).await.unwrap();
        assert!(outcome.processed, "{kind}");

        let replay = h.services.webhooks.process(request(event)).await.unwrap();
        assert!(!replay.processed, "{kind}");
    }
}

#[tokio::test]
async fn test_unmapped_product_still_applies_status() {
    let h = Harness::new();
    let user_id = h.user();

    let event = WebhookEvent {
        event_type: "INITIAL_PURCHASE".to_string(),
        product_id: Some("com.example.mystery".to_string()),
        ..purchase_event("evt-1", &user_id.to_string(), "T1")
    };
    assert!(h.services.webhooks.process(request(event)).await.unwrap().processed);

    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 10);
    let view = h.services.subscriptions.get_subscription(user_id).await.unwrap();
    assert_eq!(view.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_transfer_without_recipients_is_not_processed() {
    let h = Harness::new();
    let user_id = h.user();

    let empty = WebhookEvent {
        id: "evt-t1".to_string(),
        event_type: "TRANSFER".to_string(),
        ..WebhookEvent::default()
    };
    assert!(!h.services.webhooks.process(request(empty)).await.unwrap().processed);

    let transfer = WebhookEvent {
        id: "evt-t2".to_string(),
        event_type: "TRANSFER".to_string(),
        transferred_from: Some(vec!["$RCAnonymousID:old".to_string()]),
        transferred_to: Some(vec![user_id.to_string()]),
        ..WebhookEvent::default()
    };
    assert!(h.services.webhooks.process(request(transfer)).await.unwrap().processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 10);
}

#[tokio::test]
async fn test_malformed_and_unresolved_events() {
    let h = Harness::new();
    let webhooks = &h.services.webhooks;

    assert!(matches!(
        webhooks.process(None).await,
        Err(BillingError::InvalidInput(_))
    ));
    assert!(matches!(
        webhooks.process(Some(WebhookRequest::default())).await,
        Err(BillingError::InvalidInput(_))
    ));
    assert!(matches!(
        webhooks.process(request(purchase_event(" ", "x", "T1"))).await,
        Err(BillingError::InvalidInput(_))
    ));

    let err = webhooks
        .process(request(purchase_event("evt-404", "$RCAnonymousID:stranger", "T1")))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::WebhookUserNotFound(_)));
    assert!(!err.is_retryable());

    // An unresolved event is not marked, so a redelivery after linking succeeds
    let user_id = h.user_with(|u| u.billing_customer_id = Some("$RCAnonymousID:stranger".into()));
    let outcome = webhooks
        .process(request(purchase_event("evt-404", "$RCAnonymousID:stranger", "T1")))
        .await
        .unwrap();
    assert!(outcome.processed);
    assert_eq!(h.services.credits.balance(user_id).await.unwrap(), 10);
}
