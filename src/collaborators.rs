//! Order and identity services the payment core depends on
//!
//! The catalog, cart and account modules live elsewhere; only the lookups the
//! payment flow needs are modelled here.

use crate::error::PaymentResult;
use crate::payments::money::Money;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// The slice of an order the payment core reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRef {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total: Money,
}

#[async_trait]
pub trait OrderLookup: Send + Sync {
    async fn find_order(&self, id: Uuid) -> PaymentResult<Option<OrderRef>>;
}

/// Authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub is_staff: bool,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Resolve a bearer token; `None` when it is unknown or expired
    async fn authenticate(&self, token: &str) -> PaymentResult<Option<AuthUser>>;
}

/// Orders held in process
#[derive(Default)]
pub struct InMemoryOrders {
    orders: RwLock<HashMap<Uuid, OrderRef>>,
}

impl InMemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: OrderRef) {
        if let Ok(mut orders) = self.orders.write() {
            orders.insert(order.id, order);
        }
    }
}

#[async_trait]
impl OrderLookup for InMemoryOrders {
    async fn find_order(&self, id: Uuid) -> PaymentResult<Option<OrderRef>> {
        Ok(self
            .orders
            .read()
            .ok()
            .and_then(|orders| orders.get(&id).cloned()))
    }
}

/// Fixed token table
#[derive(Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<String, AuthUser>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: impl Into<String>, user: AuthUser) -> Self {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), user);
        }
        self
    }
}

#[async_trait]
impl IdentityService for StaticTokens {
    async fn authenticate(&self, token: &str) -> PaymentResult<Option<AuthUser>> {
        Ok(self
            .tokens
            .read()
            .ok()
            .and_then(|tokens| tokens.get(token).copied()))
    }
}
