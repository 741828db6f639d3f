//! Core entities: orders, the event log they replay from, fills, positions,
//! the transactional outbox, risk limits and the kill switch snapshot.
//!
//! All monetary and quantity fields are `Decimal`; no floats cross a
//! persistence boundary anywhere in this crate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign applied to a fill quantity when accumulating a signed position.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Lifecycle states of an order. Transitions are enforced by
/// [`crate::state_machine::OrderStateMachine`]; this enum only names the
/// reachable states and is never constructed outside that module's
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingNew,
    /// Accepted by this store and handed to the exchange adapter, but not
    /// yet acknowledged as resting on the exchange's book.
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// States in which the order still has quantity resting or in flight
    /// at the exchange and can therefore still receive fills.
    pub fn is_fillable(self) -> bool {
        matches!(
            self,
            OrderStatus::Open | OrderStatus::PartiallyFilled | OrderStatus::PendingCancel
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub client_order_id: String,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    /// Trigger price for `StopLoss`/`TakeProfit` orders; unused by
    /// `Market`/`Limit`.
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic row version; bumped on every transition, used for
    /// optimistic-locking reads from other components.
    pub version: i64,
}

impl Order {
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// One entry in the durable, append-only order event log. Replaying
/// `OrderEvent` rows for an `order_id` in sequence order must reproduce
/// the order's current projected state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_id: Uuid,
    pub order_id: Uuid,
    pub sequence: i64,
    pub event_type: OrderEventType,
    /// Serialized snapshot of the event payload, stored as JSON so the
    /// event log schema doesn't grow a column per event type.
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventType {
    Created,
    Submitted,
    Opened,
    Rejected,
    PartiallyFilled,
    Filled,
    CancelRequested,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: Uuid,
    /// Exchange-assigned trade identifier; unique per (exchange, symbol)
    /// and the basis of the ingestor's idempotency check.
    pub exchange_trade_id: String,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub liquidity: Liquidity,
    pub traded_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Maker,
    Taker,
}

/// A user's net position in one symbol. `quantity` is signed: positive is
/// long, negative is short, zero is flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: Uuid,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    /// When this projection was last updated by the projector; compared
    /// against wall-clock time by readers to flag staleness.
    pub data_as_of: DateTime<Utc>,
    /// Bumped on every update; read by the risk validator's approval
    /// cache and checked by the admission façade to detect staleness.
    pub version: i64,
}

impl Position {
    pub fn flat(user_id: Uuid, symbol: impl Into<String>, now: DateTime<Utc>) -> Self {
        Position {
            user_id,
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            data_as_of: now,
            version: 1,
        }
    }

    /// Whether this projection is too old to act on, per the projector's
    /// staleness policy (`now - data_as_of > staleness`).
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        now - self.data_as_of > staleness
    }

    /// Applies a fill's effect on this position, following the sign-flip
    /// rule: average entry price holds through a reduction, and is
    /// recomputed from the fill price only for the portion of the fill
    /// quantity that remains once the position has crossed through zero.
    pub fn apply_fill(
        &mut self,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) {
        let signed_qty = side.sign() * quantity;
        let old_qty = self.quantity;
        let new_qty = old_qty + signed_qty;

        let same_direction_or_flat = old_qty == Decimal::ZERO || old_qty.signum() == signed_qty.signum();

        if same_direction_or_flat {
            if new_qty != Decimal::ZERO {
                let old_notional = self.avg_entry_price * old_qty.abs();
                let new_notional = price * signed_qty.abs();
                self.avg_entry_price = (old_notional + new_notional) / new_qty.abs();
            }
        } else {
            // Reducing or crossing through zero.
            let closing_qty = old_qty.abs().min(signed_qty.abs());
            let realized = (price - self.avg_entry_price) * closing_qty * old_qty.signum();
            self.realized_pnl += realized;

            if new_qty == Decimal::ZERO {
                self.avg_entry_price = Decimal::ZERO;
            } else if new_qty.signum() != old_qty.signum() {
                // Crossed through zero: the remainder becomes a fresh
                // position on the other side, priced at the fill.
                self.avg_entry_price = price;
            }
            // else: reduced but did not cross, avg_entry_price unchanged.
        }

        self.quantity = new_qty;
        self.total_fees += fee;
        self.data_as_of = now;
        self.version += 1;
    }
}

/// Per-(user, symbol) risk limits, with a symbol-specific row taking
/// precedence over a user-wide default row (`symbol == "*"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub user_id: Uuid,
    /// `"*"` denotes the user-wide default row; a symbol-specific row
    /// takes precedence when both exist.
    pub symbol: String,
    pub max_position_size: Decimal,
    pub max_exposure: Decimal,
    pub max_daily_loss: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Cluster-visible kill switch snapshot, read from the registry before
/// every order admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
}

impl KillSwitchState {
    pub fn clear() -> Self {
        KillSwitchState {
            active: false,
            reason: None,
            activated_at: None,
            activated_by: None,
        }
    }
}

/// A row in the transactional outbox: written in the same DB transaction
/// that commits a fill or order-state change, published by a separate
/// relay loop, and deleted (or marked published) once delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub outbox_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// One row of the reconciliation sweep's audit trail: the before/after
/// order snapshot around whichever of `NO_CHANGE, STATE_UPDATED,
/// FILLS_ADDED, MARKED_REJECTED, CRITICAL_DISCREPANCY` the sweep applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationLogEntry {
    pub log_id: Uuid,
    pub order_id: Uuid,
    pub action: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
