//! Integration tests for the Postgres ledger and the Redis webhook markers
//!
//! These tests require a running Postgres and Redis instance.
//! Run with: REDIS_URL=redis://localhost:6379 DATABASE_URL=postgres://... cargo test --features cache --test ledger_integration_test -- --ignored

#[cfg(feature = "cache")]
mod ledger_tests {
    use std::sync::Arc;
    use storefront_payments::cache::{keys, CacheConfig, WebhookMarkerCache};
    use storefront_payments::database::{init_pool, run_migrations, PoolConfig};
    use storefront_payments::database::error::DatabaseErrorKind;
    use storefront_payments::ledger::{
        Ledger, NewPayment, NewPaymentMethod, NewRefund, PaymentMethodKind, PaymentStatus,
        PaymentTransition, RefundReason, SavedMethodType, TransitionOutcome,
    };
    use storefront_payments::payments::{Currency, Money, ProcessedEvents, Provider};
    use uuid::Uuid;

    async fn setup_cache() -> WebhookMarkerCache {
        let config = CacheConfig::new(
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        );
        let pool = storefront_payments::cache::init_cache_pool(config)
            .await
            .expect("Failed to init cache pool");
        WebhookMarkerCache::new(pool)
    }

    async fn setup_ledger() -> Ledger {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = init_pool(&database_url, Some(PoolConfig::default()))
            .await
            .expect("Failed to init DB pool");
        run_migrations(&pool).await.expect("Failed to migrate");
        Ledger::postgres(pool)
    }

    fn new_payment(amount: i64) -> NewPayment {
        NewPayment {
            order_id: Uuid::new_v4(),
            provider: Provider::Stripe,
            method: PaymentMethodKind::Card,
            amount: Money::new(amount, Currency::USD),
            intent_id: format!("pi_{}", Uuid::new_v4().simple()),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_transitions_are_forward_only_in_postgres() {
        let ledger = setup_ledger().await;
        let payment = ledger.payments.insert_payment(new_payment(10_000)).await.unwrap();

        // Duplicate intent ids are refused
        let mut duplicate = new_payment(10_000);
        duplicate.intent_id = payment.intent_id.clone();
        let err = ledger.payments.insert_payment(duplicate).await.unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::UniqueConstraintViolation { .. }));

        let succeed = PaymentTransition::Succeed {
            transaction_id: Some("ch_pg".into()),
            card: None,
        };
        let (settled, outcome) = ledger
            .payments
            .transition_payment(payment.id, &succeed)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(settled.status, PaymentStatus::Succeeded);

        let (again, outcome) = ledger
            .payments
            .transition_payment(payment.id, &succeed)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(again.processed_at, settled.processed_at);

        let (_, outcome) = ledger
            .payments
            .transition_payment(
                payment.id,
                &PaymentTransition::Fail {
                    reason: "late decline".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Conflicting);
    }

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_reservations_respect_balance() {
        let ledger = setup_ledger().await;
        let payment = ledger.payments.insert_payment(new_payment(10_000)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let refunds = ledger.refunds.clone();
            let payment = payment.clone();
            tasks.push(tokio::spawn(async move {
                refunds
                    .reserve_refund(NewRefund {
                        payment_id: payment.id,
                        order_id: payment.order_id,
                        provider: payment.provider,
                        amount: Money::new(3_000, Currency::USD),
                        reason: RefundReason::RequestedByCustomer,
                        notes: None,
                        idempotency_key: None,
                        processed_by_user_id: None,
                    })
                    .await
            }));
        }

        let mut reserved = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => reserved += 1,
                Err(e) => assert!(matches!(e.kind, DatabaseErrorKind::InsufficientBalance { .. })),
            }
        }
        assert_eq!(reserved, 3);
    }

    #[tokio::test]
    #[ignore]
    async fn test_set_default_race_in_postgres() {
        let ledger = setup_ledger().await;
        let user_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..4 {
            let method = ledger
                .methods
                .insert_method(NewPaymentMethod {
                    user_id,
                    provider: Provider::Stripe,
                    provider_method_id: format!("pm_pg_{}", i),
                    method_type: SavedMethodType::Card,
                    card_brand: Some("visa".into()),
                    card_last4: Some("4242".into()),
                    exp_month: Some(1),
                    exp_year: Some(2030),
                    make_default: false,
                })
                .await
                .unwrap();
            ids.push(method.id);
        }

        let tasks: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let methods = ledger.methods.clone();
                tokio::spawn(async move { methods.set_default_method(user_id, id).await })
            })
            .collect();
        for task in tasks {
            let _ = task.await.unwrap();
        }

        let methods = ledger.methods.list_active_methods(user_id).await.unwrap();
        assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_webhook_markers_round_trip() {
        let cache = setup_cache().await;
        let event_id = format!("evt_{}", Uuid::new_v4().simple());

        assert!(!cache.is_processed(Provider::Stripe, &event_id).await);
        cache.mark_processed(Provider::Stripe, &event_id).await;
        assert!(cache.is_processed(Provider::Stripe, &event_id).await);
        // Markers are per provider
        assert!(!cache.is_processed(Provider::PayPal, &event_id).await);

        let key = keys::webhook_event(Provider::Stripe, &event_id);
        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.is_processed(Provider::Stripe, &event_id).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_failure_falls_back_to_ledger() {
        let config = CacheConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: std::time::Duration::from_millis(200),
            ..Default::default()
        };
        if let Ok(pool) = storefront_payments::cache::init_cache_pool(config).await {
            let cache: Arc<dyn ProcessedEvents> = Arc::new(WebhookMarkerCache::new(pool));
            assert!(!cache.is_processed(Provider::Stripe, "evt_unreachable").await);
            cache.mark_processed(Provider::Stripe, "evt_unreachable").await;
        }
    }
}
