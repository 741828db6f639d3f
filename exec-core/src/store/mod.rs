//! Durable store trait: transactional persistence of orders, order
//! events, fills, positions, the outbox and the reconciliation log.
//!
//! `SELECT ... FOR UPDATE` has no equivalent in the sqlite backend; each
//! mutating method below runs its work inside one `IMMEDIATE` transaction,
//! which SQLite serializes at the writer level, see [`sqlite::SqliteStore`].
//! The trait is written so a future Postgres-backed implementation with
//! true row locks could be swapped in without touching callers.

pub mod sqlite;

use crate::domain::{Fill, Order, OrderEvent, OrderStatus, OutboxRow, Position, ReconciliationLogEntry, RiskLimits};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Inputs to `Store::create_order`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: Uuid,
    pub client_order_id: String,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: crate::domain::Side,
    pub order_type: crate::domain::OrderType,
    pub time_in_force: crate::domain::TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
}

/// Inputs to `Store::process_fill`.
#[derive(Debug, Clone)]
pub struct NewFill {
    pub fill_id: Uuid,
    pub exchange_trade_id: String,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: crate::domain::Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub liquidity: crate::domain::Liquidity,
    pub traded_at: DateTime<Utc>,
}

/// Outcome of `Store::process_fill`. `AlreadyProcessed` is the idempotent
/// no-op path for a replayed `exchange_trade_id`, checked against the
/// `exchange_trade_id` unique constraint before anything else, so it takes
/// priority over `NotFillable`/`ExceedsQuantity`: a replay of a fill that
/// already pushed the order to a terminal status is a no-op, not an error.
#[derive(Debug)]
pub enum ProcessFillOutcome {
    Applied(Order),
    AlreadyProcessed,
    NotFillable(OrderStatus),
    ExceedsQuantity,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert an order with status `PendingNew` and its `Created` event,
    /// both in one transaction.
    async fn create_order(&self, new_order: NewOrder, now: DateTime<Utc>) -> Result<Order, StoreError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError>;

    async fn list_orders_by_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError>;

    async fn list_fills_by_order(&self, order_id: Uuid) -> Result<Vec<Fill>, StoreError>;

    async fn list_events_by_order(&self, order_id: Uuid) -> Result<Vec<OrderEvent>, StoreError>;

    /// Transition an order to `new_status`, appending the matching event.
    /// Fails with `StoreError::Backend` wrapping `ExecError::InvalidTransition`
    /// semantics enforced by the caller before this is invoked, this
    /// method itself only persists, it does not validate the transition
    /// graph (see `state_machine::OrderStateMachine`).
    async fn transition_order(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        exchange_order_id: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError>;

    /// Insert the fill, update the order and append the outbox row, all
    /// inside one transaction. Returns `AlreadyProcessed` on unique-
    /// violation of `exchange_trade_id` without mutating anything else.
    async fn process_fill(&self, fill: NewFill, now: DateTime<Utc>) -> Result<ProcessFillOutcome, StoreError>;

    /// Non-final orders created within the lookback window, for the
    /// reconciliation sweep.
    async fn non_final_orders_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError>;

    async fn append_reconciliation_log(
        &self,
        order_id: Uuid,
        action: &str,
        before: serde_json::Value,
        after: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Most recent reconciliation log entries, newest first, optionally
    /// filtered to one order. Used by the `tail-reconciliation-log`
    /// inspection tool.
    async fn list_reconciliation_log(&self, order_id: Option<Uuid>, limit: i64) -> Result<Vec<ReconciliationLogEntry>, StoreError>;

    /// Up to `limit` unprocessed outbox rows, oldest first.
    async fn fetch_unprocessed_outbox(&self, limit: i64) -> Result<Vec<OutboxRow>, StoreError>;

    async fn get_or_create_position(&self, user_id: Uuid, symbol: &str, now: DateTime<Utc>) -> Result<Position, StoreError>;

    /// Update a position and mark its outbox row processed in one
    /// transaction, failing with `OptimisticLockFailed`-shaped
    /// `StoreError` (surfaced by the caller as `ExecError`) when
    /// `expected_version` no longer matches the stored row.
    async fn apply_outbox_row(
        &self,
        outbox_id: Uuid,
        updated_position: Position,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_outbox_processed_no_effect(&self, outbox_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Resolve risk limits for (user, symbol) with the symbol-specific
    /// row taking precedence over the `"*"` default row.
    async fn get_risk_limits(&self, user_id: Uuid, symbol: &str) -> Result<Option<RiskLimits>, StoreError>;

    async fn upsert_risk_limits(&self, limits: RiskLimits) -> Result<(), StoreError>;
}
