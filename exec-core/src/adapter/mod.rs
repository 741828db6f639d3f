//! Exchange adapter: rate limiter, circuit breaker, REST client and
//! user-data stream, composed behind one façade trait so the simulated
//! and live implementations are interchangeable.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod rest;
pub mod stream;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};

use crate::domain::{OrderType, Side, TimeInForce};
use crate::error::ExecError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderResponse {
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeOrderStatus {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangeTrade {
    pub exchange_trade_id: String,
    pub exchange_order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub traded_at: chrono::DateTime<chrono::Utc>,
}

/// Object-safe exchange boundary, shared by the live REST/WS client and
/// `exec-adapter-sim`'s in-memory implementation so callers can depend on
/// `Arc<dyn ExchangeAdapter>` without caring which one is wired in.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResponse, ExecError>;
    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), ExecError>;
    async fn query_order(&self, symbol: &str, exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError>;
    async fn list_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError>;
    async fn list_order_trades(&self, symbol: &str, exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError>;
    async fn get_listen_key(&self) -> Result<String, ExecError>;
    async fn keep_alive_listen_key(&self, key: &str) -> Result<(), ExecError>;
}
