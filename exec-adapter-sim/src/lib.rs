//! In-memory simulated exchange adapter for tests and local runs without
//! network access.
//!
//! Every order fills fully at its requested price the instant it's
//! placed, tracked by order id; each fill also appends to a per-order
//! trade list so `list_order_trades` has something to return.

use async_trait::async_trait;
use dashmap::DashMap;
use exec_core::adapter::{
    ExchangeAdapter, ExchangeOrderStatus, ExchangeTrade, PlaceOrderRequest, PlaceOrderResponse,
};
use exec_core::error::ExecError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

struct SimulatedOrder {
    symbol: String,
    status: String,
    filled_qty: rust_decimal::Decimal,
    avg_price: rust_decimal::Decimal,
    trades: Vec<ExchangeTrade>,
}

/// Fills every order immediately and fully at its requested price
/// (market orders) or limit price (limit orders). Listen keys are
/// stubbed UUIDs with no actual upstream connection.
pub struct SimulatedAdapter {
    orders: DashMap<String, SimulatedOrder>,
    next_order_id: AtomicI64,
    next_trade_id: AtomicI64,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            next_order_id: AtomicI64::new(1),
            next_trade_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedAdapter {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResponse, ExecError> {
        let exchange_order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed).to_string();
        let fill_price = req.price.or(req.stop_price).unwrap_or(rust_decimal::Decimal::ONE);
        let trade = ExchangeTrade {
            exchange_trade_id: self.next_trade_id.fetch_add(1, Ordering::Relaxed).to_string(),
            exchange_order_id: exchange_order_id.clone(),
            price: fill_price,
            quantity: req.quantity,
            fee: req.quantity * fill_price * rust_decimal::Decimal::new(1, 3),
            fee_asset: "USDT".to_string(),
            traded_at: chrono::Utc::now(),
        };
        self.orders.insert(
            exchange_order_id.clone(),
            SimulatedOrder {
                symbol: req.symbol,
                status: "FILLED".to_string(),
                filled_qty: req.quantity,
                avg_price: fill_price,
                trades: vec![trade],
            },
        );
        info!(exchange_order_id, "simulated order filled immediately");
        Ok(PlaceOrderResponse { exchange_order_id })
    }

    async fn cancel_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<(), ExecError> {
        if let Some(mut entry) = self.orders.get_mut(exchange_order_id) {
            entry.status = "CANCELED".to_string();
            Ok(())
        } else {
            Err(ExecError::ExchangeApiError {
                code: "NOT_FOUND".to_string(),
                message: format!("no simulated order {exchange_order_id}"),
            })
        }
    }

    async fn query_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError> {
        self.orders
            .get(exchange_order_id)
            .map(|order| ExchangeOrderStatus {
                exchange_order_id: exchange_order_id.to_string(),
                status: order.status.clone(),
                filled_qty: order.filled_qty,
                avg_price: order.avg_price,
            })
            .ok_or_else(|| ExecError::ExchangeApiError {
                code: "NOT_FOUND".to_string(),
                message: format!("no simulated order {exchange_order_id}"),
            })
    }

    async fn list_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError> {
        Ok(self
            .orders
            .iter()
            .filter(|entry| entry.status != "FILLED" && entry.status != "CANCELED")
            .filter(|entry| symbol.map(|s| s == entry.symbol).unwrap_or(true))
            .map(|entry| ExchangeOrderStatus {
                exchange_order_id: entry.key().clone(),
                status: entry.status.clone(),
                filled_qty: entry.filled_qty,
                avg_price: entry.avg_price,
            })
            .collect())
    }

    async fn list_order_trades(&self, _symbol: &str, exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError> {
        Ok(self
            .orders
            .get(exchange_order_id)
            .map(|order| order.trades.clone())
            .unwrap_or_default())
    }

    async fn get_listen_key(&self) -> Result<String, ExecError> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn keep_alive_listen_key(&self, _key: &str) -> Result<(), ExecError> {
        Ok(())
    }
}

pub fn shared() -> Arc<SimulatedAdapter> {
    Arc::new(SimulatedAdapter::new())
}
