//! Reconciliation loop: a periodic sweep of non-final orders against the
//! exchange's view, applying priority-ordered resolution rules and never
//! silently reducing a locally recorded filled quantity.
//!
//! One tick at a time: a `try_lock` guard skips a sweep entirely rather
//! than letting two overlapping sweeps race on the same order, and every
//! applied action is written to the reconciliation log before the tick
//! returns.

use crate::adapter::{ExchangeAdapter, ExchangeOrderStatus};
use crate::domain::{Liquidity, Order, OrderStatus};
use crate::error::ExecError;
use crate::state_machine::{FillParams, OrderStateMachine};
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval: std::time::Duration,
    pub lookback: ChronoDuration,
    pub submission_timeout: ChronoDuration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            lookback: ChronoDuration::hours(24),
            submission_timeout: ChronoDuration::minutes(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconciliationStats {
    pub ticks_run: AtomicU64,
    pub orders_checked: AtomicU64,
    pub state_updated: AtomicU64,
    pub fills_added: AtomicU64,
    pub marked_rejected: AtomicU64,
    pub critical_discrepancies: AtomicU64,
    pub errors: AtomicU64,
}

enum Action {
    NoChange,
    StateUpdated,
    FillsAdded,
    MarkedRejected,
    CriticalDiscrepancy,
}

fn map_exchange_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "NEW" => Some(OrderStatus::Open),
        "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
        "FILLED" => Some(OrderStatus::Filled),
        "CANCELED" => Some(OrderStatus::Canceled),
        "PENDING_CANCEL" => Some(OrderStatus::Open),
        "REJECTED" => Some(OrderStatus::Rejected),
        "EXPIRED" => Some(OrderStatus::Expired),
        _ => None,
    }
}

pub struct ReconciliationLoop {
    store: Arc<dyn Store>,
    adapter: Arc<dyn ExchangeAdapter>,
    state_machine: Arc<OrderStateMachine>,
    config: ReconciliationConfig,
    running: Mutex<()>,
    pub stats: ReconciliationStats,
}

impl ReconciliationLoop {
    pub fn new(
        store: Arc<dyn Store>,
        adapter: Arc<dyn ExchangeAdapter>,
        state_machine: Arc<OrderStateMachine>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            state_machine,
            config,
            running: Mutex::new(()),
            stats: ReconciliationStats::default(),
        }
    }

    pub async fn run_forever(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "reconciliation tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one sweep. Skips entirely (returning `Ok(())`) if a previous
    /// tick is still running.
    pub async fn tick(&self) -> Result<(), ExecError> {
        let guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("reconciliation tick skipped, previous run still in progress");
                return Ok(());
            }
        };

        self.stats.ticks_run.fetch_add(1, Ordering::Relaxed);
        let cutoff = Utc::now() - self.config.lookback;
        let orders = self.store.non_final_orders_since(cutoff).await?;

        for order in orders {
            self.stats.orders_checked.fetch_add(1, Ordering::Relaxed);
            match self.reconcile_order(&order).await {
                Ok(action) => self.record(action),
                Err(err) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(order_id = %order.order_id, error = %err, "failed to reconcile order");
                }
            }
        }

        drop(guard);
        Ok(())
    }

    fn record(&self, action: Action) {
        match action {
            Action::NoChange => {}
            Action::StateUpdated => {
                self.stats.state_updated.fetch_add(1, Ordering::Relaxed);
            }
            Action::FillsAdded => {
                self.stats.fills_added.fetch_add(1, Ordering::Relaxed);
            }
            Action::MarkedRejected => {
                self.stats.marked_rejected.fetch_add(1, Ordering::Relaxed);
            }
            Action::CriticalDiscrepancy => {
                self.stats.critical_discrepancies.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn reconcile_order(&self, order: &Order) -> Result<Action, ExecError> {
        let before = serde_json::to_value(order).unwrap_or_default();

        // Rule (a): never submitted.
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            if Utc::now() - order.created_at > self.config.submission_timeout {
                self.state_machine
                    .transition_order(order.order_id, OrderStatus::Rejected, None, serde_json::json!({"reason": "SUBMISSION_TIMEOUT"}))
                    .await?;
                self.log(order.order_id, "MARKED_REJECTED", before, serde_json::json!({"status": "REJECTED"})).await;
                return Ok(Action::MarkedRejected);
            }
            self.log(order.order_id, "NO_CHANGE", before.clone(), before).await;
            return Ok(Action::NoChange);
        };

        let exchange_status = self.adapter.query_order(&order.symbol, &exchange_order_id).await?;
        let Some(mapped) = map_exchange_status(&exchange_status.status) else {
            warn!(order_id = %order.order_id, status = %exchange_status.status, "unknown exchange status, skipping order");
            return Ok(Action::NoChange);
        };

        // Rule (b): exchange terminal state is authoritative.
        if matches!(mapped, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired) {
            let mut action = Action::NoChange;
            if mapped != order.status {
                self.state_machine
                    .transition_order(order.order_id, mapped, Some(exchange_order_id.clone()), serde_json::json!({"reconciliation": true}))
                    .await?;
                action = Action::StateUpdated;
            }
            let imported = self.import_missing_fills(order, &exchange_status).await?;
            if imported {
                action = Action::FillsAdded;
            }
            self.log(order.order_id, action_name(&action), before, serde_json::to_value(&exchange_status).unwrap_or_default()).await;
            return Ok(action);
        }

        // Rule (c): gap, exchange ahead of local.
        if exchange_status.filled_qty > order.filled_quantity {
            let imported = self.import_missing_fills(order, &exchange_status).await?;
            let action = if imported { Action::FillsAdded } else { Action::NoChange };
            self.log(order.order_id, action_name(&action), before, serde_json::to_value(&exchange_status).unwrap_or_default()).await;
            return Ok(action);
        }

        // Rule (d): local ahead of exchange, never mutate, only alert.
        if order.filled_quantity > exchange_status.filled_qty {
            error!(order_id = %order.order_id, local = %order.filled_quantity, exchange = %exchange_status.filled_qty, "critical discrepancy: local filled exceeds exchange");
            self.log(order.order_id, "CRITICAL_DISCREPANCY", before, serde_json::to_value(&exchange_status).unwrap_or_default()).await;
            return Ok(Action::CriticalDiscrepancy);
        }

        // Rule (e): non-terminal status mismatch.
        if mapped != order.status {
            self.state_machine
                .transition_order(order.order_id, mapped, Some(exchange_order_id), serde_json::json!({"reconciliation": true, "exchange_status": exchange_status.status}))
                .await?;
            self.log(order.order_id, "STATE_UPDATED", before, serde_json::to_value(&exchange_status).unwrap_or_default()).await;
            return Ok(Action::StateUpdated);
        }

        self.log(order.order_id, "NO_CHANGE", before.clone(), before).await;
        Ok(Action::NoChange)
    }

    /// Fetches the exchange's trade list and inserts any trade not yet
    /// recorded locally. Unique-constraint violations on `exchange_trade_id`
    /// are dedup, not errors (`process_fill` already treats them that way).
    async fn import_missing_fills(&self, order: &Order, _exchange_status: &ExchangeOrderStatus) -> Result<bool, ExecError> {
        let trades = self.adapter.list_order_trades(&order.symbol, order.exchange_order_id.as_deref().unwrap_or_default()).await?;
        let mut any_new = false;
        for trade in trades {
            let outcome = self
                .state_machine
                .process_fill(FillParams {
                    exchange_trade_id: trade.exchange_trade_id,
                    order_id: order.order_id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    price: trade.price,
                    quantity: trade.quantity,
                    fee: trade.fee,
                    fee_asset: trade.fee_asset,
                    liquidity: Liquidity::Taker,
                    traded_at: trade.traded_at,
                })
                .await?;
            if outcome.is_some() {
                any_new = true;
            }
        }
        Ok(any_new)
    }

    async fn log(&self, order_id: uuid::Uuid, action: &str, before: serde_json::Value, after: serde_json::Value) {
        if let Err(err) = self.store.append_reconciliation_log(order_id, action, before, after, Utc::now()).await {
            error!(order_id = %order_id, error = %err, "failed to write reconciliation log entry");
        }
    }
}

fn action_name(action: &Action) -> &'static str {
    match action {
        Action::NoChange => "NO_CHANGE",
        Action::StateUpdated => "STATE_UPDATED",
        Action::FillsAdded => "FILLS_ADDED",
        Action::MarkedRejected => "MARKED_REJECTED",
        Action::CriticalDiscrepancy => "CRITICAL_DISCREPANCY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ExchangeTrade, PlaceOrderRequest, PlaceOrderResponse};
    use crate::domain::Side;
    use crate::state_machine::CreateOrderRequest;
    use crate::store::sqlite::SqliteStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    /// Scripted exchange double: returns the next queued status/trade set
    /// for every order regardless of id, good enough for one-order-per-test
    /// sweeps.
    #[derive(Default)]
    struct FakeAdapter {
        status: StdMutex<Option<ExchangeOrderStatus>>,
        trades: StdMutex<Vec<ExchangeTrade>>,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn place_order(&self, _req: PlaceOrderRequest) -> Result<PlaceOrderResponse, ExecError> {
            unimplemented!("not exercised by reconciliation tests")
        }
        async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn query_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError> {
            Ok(self.status.lock().unwrap().clone().expect("status must be queued"))
        }
        async fn list_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError> {
            Ok(vec![])
        }
        async fn list_order_trades(&self, _symbol: &str, _exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError> {
            Ok(self.trades.lock().unwrap().clone())
        }
        async fn get_listen_key(&self) -> Result<String, ExecError> {
            Ok("key".into())
        }
        async fn keep_alive_listen_key(&self, _key: &str) -> Result<(), ExecError> {
            Ok(())
        }
    }

    async fn setup() -> (Arc<dyn Store>, Arc<OrderStateMachine>, Arc<FakeAdapter>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        (store, state_machine, Arc::new(FakeAdapter::default()))
    }

    #[tokio::test]
    async fn never_submitted_past_timeout_is_marked_rejected() {
        let (store, state_machine, adapter) = setup().await;
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: crate::domain::OrderType::Limit,
                time_in_force: crate::domain::TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(1),
                stop_price: None,
            })
            .await
            .unwrap();

        let loop_ = ReconciliationLoop::new(
            store.clone(),
            adapter.clone() as Arc<dyn ExchangeAdapter>,
            state_machine,
            ReconciliationConfig {
                interval: std::time::Duration::from_secs(60),
                lookback: ChronoDuration::hours(24),
                submission_timeout: ChronoDuration::seconds(-1), // already "timed out"
            },
        );

        let action = loop_.reconcile_order(&order).await.unwrap();
        assert!(matches!(action, Action::MarkedRejected));
        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn exchange_ahead_imports_missing_fills() {
        let (store, state_machine, adapter) = setup().await;
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: crate::domain::OrderType::Limit,
                time_in_force: crate::domain::TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(10),
                stop_price: None,
            })
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Submitted, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Open, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();
        let order = store.get_order(order.order_id).await.unwrap();

        *adapter.status.lock().unwrap() = Some(ExchangeOrderStatus {
            exchange_order_id: "ex-1".into(),
            status: "PARTIALLY_FILLED".into(),
            filled_qty: dec!(4),
            avg_price: dec!(100),
        });
        *adapter.trades.lock().unwrap() = vec![ExchangeTrade {
            exchange_trade_id: "t1".into(),
            exchange_order_id: "ex-1".into(),
            price: dec!(100),
            quantity: dec!(4),
            fee: dec!(0.01),
            fee_asset: "USDT".into(),
            traded_at: Utc::now(),
        }];

        let loop_ = ReconciliationLoop::new(store.clone(), adapter.clone() as Arc<dyn ExchangeAdapter>, state_machine, ReconciliationConfig::default());
        let action = loop_.reconcile_order(&order).await.unwrap();
        assert!(matches!(action, Action::FillsAdded));
        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.filled_quantity, dec!(4));
        assert_eq!(after.status, OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn local_ahead_of_exchange_is_critical_discrepancy_and_does_not_mutate() {
        let (store, state_machine, adapter) = setup().await;
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: crate::domain::OrderType::Limit,
                time_in_force: crate::domain::TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(10),
                stop_price: None,
            })
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Submitted, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Open, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();
        state_machine
            .process_fill(FillParams {
                exchange_trade_id: "t1".into(),
                order_id: order.order_id,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                price: dec!(100),
                quantity: dec!(5),
                fee: dec!(0),
                fee_asset: "USDT".into(),
                liquidity: Liquidity::Taker,
                traded_at: Utc::now(),
            })
            .await
            .unwrap();
        let order = store.get_order(order.order_id).await.unwrap();
        assert_eq!(order.filled_quantity, dec!(5));

        *adapter.status.lock().unwrap() = Some(ExchangeOrderStatus {
            exchange_order_id: "ex-1".into(),
            status: "PARTIALLY_FILLED".into(),
            filled_qty: dec!(2), // exchange reports less than local
            avg_price: dec!(100),
        });

        let loop_ = ReconciliationLoop::new(store.clone(), adapter.clone() as Arc<dyn ExchangeAdapter>, state_machine, ReconciliationConfig::default());
        let action = loop_.reconcile_order(&order).await.unwrap();
        assert!(matches!(action, Action::CriticalDiscrepancy));
        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.filled_quantity, dec!(5));
        assert_eq!(after.status, OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn duplicate_fill_replay_is_idempotent() {
        let (store, state_machine, _adapter) = setup().await;
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: crate::domain::OrderType::Limit,
                time_in_force: crate::domain::TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(10),
                stop_price: None,
            })
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Submitted, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Open, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();

        let fill = || FillParams {
            exchange_trade_id: "dup-1".into(),
            order_id: order.order_id,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: dec!(100),
            quantity: dec!(3),
            fee: dec!(0),
            fee_asset: "USDT".into(),
            liquidity: Liquidity::Taker,
            traded_at: Utc::now(),
        };

        let first = state_machine.process_fill(fill()).await.unwrap();
        assert!(first.is_some());
        let second = state_machine.process_fill(fill()).await.unwrap();
        assert!(second.is_none(), "replayed exchange_trade_id must be a no-op");

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.filled_quantity, dec!(3), "quantity must not double count");
    }
}
