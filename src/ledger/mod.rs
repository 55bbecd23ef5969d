//! Payment ledger: the source of truth for payments, refunds and saved methods

pub mod memory;
pub mod models;
pub mod store;

pub use memory::MemoryLedger;
pub use models::*;
pub use store::{PaymentMethodStore, PaymentStore, RefundStore, WebhookLog};

use std::sync::Arc;

/// Handles to every ledger store, shared across services
#[derive(Clone)]
pub struct Ledger {
    pub payments: Arc<dyn PaymentStore>,
    pub refunds: Arc<dyn RefundStore>,
    pub methods: Arc<dyn PaymentMethodStore>,
    pub webhooks: Arc<dyn WebhookLog>,
}

impl Ledger {
    /// All stores backed by one `MemoryLedger`
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryLedger::new()))
    }

    pub fn from_memory(memory: Arc<MemoryLedger>) -> Self {
        Self {
            payments: memory.clone(),
            refunds: memory.clone(),
            methods: memory.clone(),
            webhooks: memory,
        }
    }

    /// Postgres repositories sharing one pool
    #[cfg(feature = "database")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use crate::database::{
            payment_method_repository::PaymentMethodRepository,
            payment_repository::PaymentRepository, refund_repository::RefundRepository,
            webhook_repository::WebhookRepository,
        };

        Self {
            payments: Arc::new(PaymentRepository::new(pool.clone())),
            refunds: Arc::new(RefundRepository::new(pool.clone())),
            methods: Arc::new(PaymentMethodRepository::new(pool.clone())),
            webhooks: Arc::new(WebhookRepository::new(pool)),
        }
    }
}
