//! Payment processing
//!
//! Gateway adapters behind one [`PaymentGateway`] contract, the orchestration
//! service that drives the ledger, the saved-method vault and webhook
//! reconciliation.

pub mod money;
pub mod providers;
pub mod reconciler;
pub mod service;
pub mod traits;
pub mod types;
pub mod vault;

pub use money::{Currency, Money};
pub use reconciler::{ProcessedEvents, WebhookDisposition, WebhookReconciler};
pub use service::{
    ConfirmResult, CreateIntent, IntentHandle, PaymentDetails, PaymentService, RefundCommand,
    ServiceConfig,
};
pub use traits::{Gateways, PaymentGateway};
pub use types::Provider;
pub use vault::{SaveMethod, VaultService};
