//! Saved payment methods
//!
//! Display fields come from the gateway, never from client input.

use crate::collaborators::AuthUser;
use crate::database::error::DatabaseErrorKind;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Ledger, NewPaymentMethod, PaymentMethod};
use crate::payments::traits::Gateways;
use crate::payments::types::Provider;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SaveMethod {
    pub provider: Provider,
    /// Gateway-side id produced by client-side tokenization
    pub provider_method_id: String,
    pub make_default: bool,
}

#[derive(Clone)]
pub struct VaultService {
    ledger: Ledger,
    gateways: Gateways,
}

impl VaultService {
    pub fn new(ledger: Ledger, gateways: Gateways) -> Self {
        Self { ledger, gateways }
    }

    pub async fn list(&self, user: &AuthUser) -> PaymentResult<Vec<PaymentMethod>> {
        Ok(self.ledger.methods.list_active_methods(user.id).await?)
    }

    /// Save a tokenized method. The user's first method becomes the default.
    pub async fn add(&self, user: &AuthUser, request: SaveMethod) -> PaymentResult<PaymentMethod> {
        let provider_method_id = request.provider_method_id.trim();
        if provider_method_id.is_empty() {
            return Err(PaymentError::Validation("paymentMethodId is required".into()));
        }

        let gateway = self.gateways.get(request.provider)?;
        let details = gateway.fetch_payment_method(provider_method_id).await?;

        let saved = self
            .ledger
            .methods
            .insert_method(NewPaymentMethod {
                user_id: user.id,
                provider: request.provider,
                provider_method_id: details.provider_method_id,
                method_type: details.method_type,
                card_brand: details.card_brand,
                card_last4: details.card_last4,
                exp_month: details.exp_month,
                exp_year: details.exp_year,
                make_default: request.make_default,
            })
            .await;

        match saved {
            Ok(method) => {
                info!(
                    user_id = %user.id,
                    method_id = %method.id,
                    is_default = method.is_default,
                    "payment method saved"
                );
                Ok(method)
            }
            Err(e) if matches!(e.kind, DatabaseErrorKind::UniqueConstraintViolation { .. }) => Err(
                PaymentError::Conflict("payment method is already saved".into()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Soft-deactivate. Removing the default leaves the user without one.
    pub async fn remove(&self, user: &AuthUser, id: Uuid) -> PaymentResult<PaymentMethod> {
        let method = self
            .ledger
            .methods
            .deactivate_method(user.id, id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment method", id))?;
        info!(user_id = %user.id, method_id = %id, "payment method removed");
        Ok(method)
    }

    pub async fn set_default(&self, user: &AuthUser, id: Uuid) -> PaymentResult<PaymentMethod> {
        let method = self
            .ledger
            .methods
            .set_default_method(user.id, id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment method", id))?;
        info!(user_id = %user.id, method_id = %id, "default payment method changed");
        Ok(method)
    }
}
