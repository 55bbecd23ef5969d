//! Webhook reconciliation
//!
//! Applies provider events to the ledger with the same forward-only
//! transitions the orchestration service uses. Redeliveries and events for
//! records this deployment never created are acknowledged without effect.

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{
    Ledger, PaymentTransition, Refund, RefundTransition, TransitionOutcome,
};
use crate::payments::traits::Gateways;
use crate::payments::types::{Authenticity, GatewayRefundStatus, Provider, WebhookEventKind};
use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fast-path memo of provider event ids that were fully processed.
///
/// Best effort: the ledger stays the authority, so implementations swallow
/// their own failures.
#[async_trait]
pub trait ProcessedEvents: Send + Sync {
    async fn is_processed(&self, provider: Provider, event_id: &str) -> bool;
    async fn mark_processed(&self, provider: Provider, event_id: &str);
}

/// What a delivery did to the ledger. Every variant is acknowledged with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Applied,
    /// Already reflected in the ledger
    Duplicate,
    /// References an intent or refund this ledger does not hold
    Unknown,
    /// Event type the ledger does not track
    Ignored,
    /// Contradicts a recorded terminal state; the ledger is kept
    Conflicting,
}

impl From<TransitionOutcome> for WebhookDisposition {
    fn from(outcome: TransitionOutcome) -> Self {
        match outcome {
            TransitionOutcome::Applied => Self::Applied,
            TransitionOutcome::Unchanged => Self::Duplicate,
            TransitionOutcome::Conflicting => Self::Conflicting,
        }
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    ledger: Ledger,
    gateways: Gateways,
    trust_unverified: bool,
    seen: Option<Arc<dyn ProcessedEvents>>,
}

impl WebhookReconciler {
    pub fn new(ledger: Ledger, gateways: Gateways) -> Self {
        Self {
            ledger,
            gateways,
            trust_unverified: false,
            seen: None,
        }
    }

    /// Accept payloads the adapter could not authenticate
    pub fn trust_unverified(mut self, trust: bool) -> Self {
        self.trust_unverified = trust;
        self
    }

    pub fn with_processed_events(mut self, seen: Arc<dyn ProcessedEvents>) -> Self {
        self.seen = Some(seen);
        self
    }

    /// Verify, record and apply one delivery.
    ///
    /// # Errors
    /// * `InvalidSignature` when authenticity fails; nothing is persisted
    /// * anything else means the event was logged but not applied, and the
    ///   provider should redeliver
    pub async fn handle(
        &self,
        provider: Provider,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookDisposition> {
        let gateway = self.gateways.get(provider)?;
        let event = match gateway.parse_webhook(payload, headers).await {
            Ok(event) => event,
            Err(e @ PaymentError::InvalidSignature(_)) => {
                warn!(%provider, error = %e, "webhook signature verification failed");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if event.authenticity == Authenticity::Unverified && !self.trust_unverified {
            warn!(
                %provider,
                event_id = %event.event_id,
                "unverified webhook rejected, verification is not configured"
            );
            return Err(PaymentError::InvalidSignature(
                "webhook could not be authenticated".into(),
            ));
        }

        if let Some(seen) = &self.seen {
            if seen.is_processed(provider, &event.event_id).await {
                debug!(%provider, event_id = %event.event_id, "webhook already processed");
                return Ok(WebhookDisposition::Duplicate);
            }
        }

        let record = self
            .ledger
            .webhooks
            .log_event(provider, &event.event_id, &event.event_type, event.payload.clone())
            .await?;
        if record.processed {
            self.remember(provider, &event.event_id).await;
            return Ok(WebhookDisposition::Duplicate);
        }

        match self.apply(provider, &event.kind).await {
            Ok(disposition) => {
                self.ledger.webhooks.mark_processed(record.id).await?;
                self.remember(provider, &event.event_id).await;
                info!(
                    %provider,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    ?disposition,
                    "webhook processed"
                );
                Ok(disposition)
            }
            Err(e) => {
                error!(
                    %provider,
                    event_id = %event.event_id,
                    error = %e,
                    "webhook processing failed"
                );
                if let Err(log_err) = self.ledger.webhooks.record_failure(record.id, &e.to_string()).await {
                    error!(error = %log_err, "failed to record webhook failure");
                }
                Err(e)
            }
        }
    }

    async fn remember(&self, provider: Provider, event_id: &str) {
        if let Some(seen) = &self.seen {
            seen.mark_processed(provider, event_id).await;
        }
    }

    async fn apply(
        &self,
        provider: Provider,
        kind: &WebhookEventKind,
    ) -> PaymentResult<WebhookDisposition> {
        let (intent_id, transition) = match kind {
            WebhookEventKind::PaymentProcessing { intent_id } => {
                (intent_id, PaymentTransition::BeginProcessing)
            }
            WebhookEventKind::PaymentSucceeded {
                intent_id,
                transaction_id,
            } => (
                intent_id,
                PaymentTransition::Succeed {
                    transaction_id: transaction_id.clone(),
                    card: None,
                },
            ),
            WebhookEventKind::PaymentFailed { intent_id, reason } => (
                intent_id,
                PaymentTransition::Fail {
                    reason: reason.clone(),
                },
            ),
            WebhookEventKind::RefundUpdated {
                provider_refund_id,
                refund_ref,
                status,
                failure_reason,
            } => {
                return self
                    .apply_refund(
                        provider,
                        provider_refund_id,
                        *refund_ref,
                        *status,
                        failure_reason.clone(),
                    )
                    .await
            }
            WebhookEventKind::Ignored => return Ok(WebhookDisposition::Ignored),
        };

        let Some(payment) = self
            .ledger
            .payments
            .find_payment_by_intent(Some(provider), intent_id)
            .await?
        else {
            info!(%provider, %intent_id, "webhook for unknown intent discarded");
            return Ok(WebhookDisposition::Unknown);
        };

        let (payment, outcome) = self
            .ledger
            .payments
            .transition_payment(payment.id, &transition)
            .await?;
        if outcome == TransitionOutcome::Conflicting {
            error!(
                payment_id = %payment.id,
                stored = payment.status.as_str(),
                reported = transition.target().as_str(),
                "webhook contradicts recorded terminal state"
            );
        }
        Ok(outcome.into())
    }

    async fn apply_refund(
        &self,
        provider: Provider,
        provider_refund_id: &str,
        refund_ref: Option<Uuid>,
        status: GatewayRefundStatus,
        failure_reason: Option<String>,
    ) -> PaymentResult<WebhookDisposition> {
        let Some(refund) = self
            .find_refund(provider, provider_refund_id, refund_ref)
            .await?
        else {
            info!(%provider, %provider_refund_id, "webhook for unknown refund discarded");
            return Ok(WebhookDisposition::Unknown);
        };

        let refund = if refund.provider_refund_id.is_none() {
            self.ledger
                .refunds
                .record_provider_refund_id(refund.id, provider_refund_id)
                .await?
        } else {
            refund
        };

        let transition = match status {
            GatewayRefundStatus::Pending => return Ok(WebhookDisposition::Duplicate),
            GatewayRefundStatus::Succeeded => RefundTransition::Succeed {
                provider_refund_id: Some(provider_refund_id.to_string()),
            },
            GatewayRefundStatus::Failed => RefundTransition::Fail {
                reason: failure_reason.unwrap_or_else(|| "Refund failed".to_string()),
            },
        };
        let (refund, outcome) = self
            .ledger
            .refunds
            .transition_refund(refund.id, &transition)
            .await?;
        if outcome == TransitionOutcome::Conflicting {
            error!(
                refund_id = %refund.id,
                stored = refund.status.as_str(),
                "refund webhook contradicts recorded terminal state"
            );
        }
        Ok(outcome.into())
    }

    /// By provider refund id, falling back to the internal id echoed in metadata
    async fn find_refund(
        &self,
        provider: Provider,
        provider_refund_id: &str,
        refund_ref: Option<Uuid>,
    ) -> PaymentResult<Option<Refund>> {
        if let Some(refund) = self
            .ledger
            .refunds
            .find_refund_by_provider_id(provider, provider_refund_id)
            .await?
        {
            return Ok(Some(refund));
        }
        match refund_ref {
            Some(id) => Ok(self
                .ledger
                .refunds
                .find_refund(id)
                .await?
                .filter(|r| r.provider == provider)),
            None => Ok(None),
        }
    }
}
