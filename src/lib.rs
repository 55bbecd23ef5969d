//! Storefront payment core
//!
//! Payment intents, confirmation, refunds and saved methods across Stripe and
//! PayPal, with a ledger that stays consistent under concurrent confirm calls
//! and at-least-once webhook delivery.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod payments;

pub use error::{PaymentError, PaymentResult};
