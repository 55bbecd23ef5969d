use crate::collaborators::IdentityService;
use crate::ledger::Ledger;
use crate::payments::{PaymentService, VaultService, WebhookReconciler};
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub payments: PaymentService,
    pub vault: VaultService,
    pub reconciler: WebhookReconciler,
    pub identity: Arc<dyn IdentityService>,
    pub ledger: Ledger,
    pub environment: String,
}
