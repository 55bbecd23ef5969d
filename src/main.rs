use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use storefront_payments::api::{self, AppState};
use storefront_payments::config::Config;
use storefront_payments::database::order_repository::OrderRepository;
use storefront_payments::database::session_repository::SessionRepository;
use storefront_payments::database::{self, PoolConfig};
use storefront_payments::ledger::Ledger;
use storefront_payments::payments::providers::{PayPalGateway, StripeGateway};
use storefront_payments::payments::{Gateways, PaymentService, VaultService, WebhookReconciler};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(!config.server.is_development());

    tracing::info!("Starting storefront payments");
    tracing::info!("Environment: {}", config.server.environment);
    if let Some(mode) = config.paypal_mode() {
        tracing::info!("PayPal mode: {}", mode);
    }

    let pool = database::init_pool(
        &config.database.url,
        Some(PoolConfig {
            max_connections: config.database.max_connections,
            ..PoolConfig::default()
        }),
    )
    .await
    .context("failed to connect to the database")?;
    database::run_migrations(&pool)
        .await
        .context("failed to apply ledger migrations")?;

    let mut gateways = Gateways::new();
    if let Some(stripe) = config.stripe_gateway_config() {
        gateways = gateways.register(Arc::new(StripeGateway::new(stripe)?));
        tracing::info!("Stripe gateway configured");
    }
    if let Some(paypal) = config.paypal_gateway_config() {
        gateways = gateways.register(Arc::new(PayPalGateway::new(paypal)?));
        tracing::info!("PayPal gateway configured");
    }

    let ledger = Ledger::postgres(pool.clone());
    let orders = Arc::new(OrderRepository::new(pool.clone()));
    let identity = Arc::new(SessionRepository::new(pool.clone()));

    #[allow(unused_mut)]
    let mut reconciler = WebhookReconciler::new(ledger.clone(), gateways.clone())
        .trust_unverified(config.payments.trust_unverified_webhooks);
    if config.payments.trust_unverified_webhooks {
        tracing::warn!("Unverified webhooks are trusted; enable signature verification in production");
    }

    #[cfg(feature = "cache")]
    {
        use storefront_payments::cache::{init_cache_pool, CacheConfig, WebhookMarkerCache};
        if let Some(redis) = &config.redis {
            match init_cache_pool(CacheConfig::new(redis.url.as_str())).await {
                Ok(redis_pool) => {
                    reconciler =
                        reconciler.with_processed_events(Arc::new(WebhookMarkerCache::new(redis_pool)));
                    tracing::info!("Webhook event markers enabled");
                }
                Err(e) => {
                    tracing::warn!("Redis unavailable, webhook dedup uses the ledger only: {}", e)
                }
            }
        }
    }

    let state = AppState {
        payments: PaymentService::new(
            ledger.clone(),
            orders,
            gateways.clone(),
            config.service_config(),
        ),
        vault: VaultService::new(ledger.clone(), gateways),
        reconciler,
        identity,
        ledger,
        environment: config.server.environment.clone(),
    };

    let app = api::router(state);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .context("HOST must be an IP address")?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. In-flight confirms and refunds finish
/// before the server returns.
async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
