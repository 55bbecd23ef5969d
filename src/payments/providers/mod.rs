//! Payment gateway implementations
//!
//! Concrete implementations of the PaymentGateway trait for each provider.

pub mod oauth;
pub mod paypal;
pub mod stripe;

pub use paypal::{PayPalConfig, PayPalGateway};
pub use stripe::{StripeConfig, StripeGateway};

use crate::error::{PaymentError, PaymentResult};
use crate::payments::types::Provider;
use http::HeaderMap;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

pub(crate) fn build_client(provider: Provider, timeout: Duration) -> PaymentResult<Client> {
    Client::builder().timeout(timeout).build().map_err(|e| {
        PaymentError::Configuration(format!("failed to build {} HTTP client: {}", provider, e))
    })
}

/// Network-level failure talking to a provider
pub(crate) fn map_transport_error(provider: Provider, error: reqwest::Error) -> PaymentError {
    if error.is_timeout() {
        warn!(%provider, "gateway request timed out");
        PaymentError::GatewayTimeout { provider }
    } else {
        warn!(%provider, error = %error, "gateway request failed");
        PaymentError::GatewayUnavailable {
            provider,
            message: error.to_string(),
        }
    }
}

/// A 2xx body that did not match the expected shape
pub(crate) fn malformed_response(provider: Provider, error: impl std::fmt::Display) -> PaymentError {
    warn!(%provider, error = %error, "unexpected gateway response");
    PaymentError::GatewayUnavailable {
        provider,
        message: format!("unexpected response: {}", error),
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
