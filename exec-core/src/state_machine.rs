//! The order state machine: validates transitions against the lifecycle
//! graph and drives the durable store's transactional inserts.
//!
//! `allowed_transitions` is the one place the lifecycle graph is written
//! down; every transition, whether from a user-submitted status change or
//! a reconciliation correction, is checked against it before anything is
//! persisted.

use crate::domain::{Order, OrderStatus, Side, TimeInForce, OrderType};
use crate::error::ExecError;
use crate::store::{NewFill, NewOrder, ProcessFillOutcome, Store};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Returns the set of statuses `from` may legally transition into.
fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        PendingNew => &[Submitted, Rejected],
        Submitted => &[Open, Rejected, Expired],
        Open => &[PartiallyFilled, Filled, Canceled, Rejected, Expired, PendingCancel],
        PartiallyFilled => &[Filled, Canceled, Rejected],
        PendingCancel => &[Canceled, Filled, PartiallyFilled],
        Filled | Canceled | Rejected | Expired => &[],
    }
}

pub struct CreateOrderRequest {
    pub client_order_id: String,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
}

pub struct FillParams {
    pub exchange_trade_id: String,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub liquidity: crate::domain::Liquidity,
    pub traded_at: DateTime<Utc>,
}

pub struct OrderStateMachine {
    store: Arc<dyn Store>,
}

impl OrderStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn validate_new_order(req: &CreateOrderRequest) -> Result<(), ExecError> {
        if req.quantity <= Decimal::ZERO {
            return Err(ExecError::ValidationError("quantity must be positive".into()));
        }
        match req.order_type {
            OrderType::Limit => {
                let price = req
                    .price
                    .ok_or_else(|| ExecError::ValidationError("price required for LIMIT orders".into()))?;
                if price <= Decimal::ZERO {
                    return Err(ExecError::ValidationError("price must be positive".into()));
                }
            }
            OrderType::Market => {
                if req.price.is_some() {
                    return Err(ExecError::ValidationError("price must not be set for MARKET orders".into()));
                }
            }
            OrderType::StopLoss | OrderType::TakeProfit => {
                let stop_price = req
                    .stop_price
                    .ok_or_else(|| ExecError::ValidationError("stop_price required for STOP_LOSS/TAKE_PROFIT orders".into()))?;
                if stop_price <= Decimal::ZERO {
                    return Err(ExecError::ValidationError("stop_price must be positive".into()));
                }
            }
        }
        Ok(())
    }

    pub async fn create_order(&self, req: CreateOrderRequest) -> Result<Order, ExecError> {
        Self::validate_new_order(&req)?;
        let now = Utc::now();
        let order = self
            .store
            .create_order(
                NewOrder {
                    order_id: Uuid::new_v4(),
                    client_order_id: req.client_order_id,
                    user_id: req.user_id,
                    symbol: req.symbol,
                    side: req.side,
                    order_type: req.order_type,
                    time_in_force: req.time_in_force,
                    price: req.price,
                    stop_price: req.stop_price,
                    quantity: req.quantity,
                },
                now,
            )
            .await?;
        Ok(order)
    }

    /// Validate `new_status` against the current status's transition
    /// table and persist, or fail with `InvalidTransition` without
    /// touching the store.
    pub async fn transition_order(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        exchange_order_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Order, ExecError> {
        let current = self.store.get_order(order_id).await?;
        if !allowed_transitions(current.status).contains(&new_status) {
            return Err(ExecError::InvalidTransition {
                from: current.status,
                to: new_status,
            });
        }
        let now = Utc::now();
        let order = self
            .store
            .transition_order(order_id, new_status, exchange_order_id, metadata, now)
            .await?;
        Ok(order)
    }

    /// Processes one fill transactionally. Returns `Ok(None)` when the
    /// fill was already applied (idempotent replay of `exchange_trade_id`).
    ///
    /// The dedup check runs inside the store, ahead of the fillable/
    /// quantity checks below: a replayed `exchange_trade_id` is a no-op
    /// even if the order has since reached a terminal status, per the
    /// idempotence invariant on repeated `process_fill` calls.
    pub async fn process_fill(&self, params: FillParams) -> Result<Option<Order>, ExecError> {
        let order_id = params.order_id;
        let fill_qty = params.quantity;
        let now = Utc::now();
        let outcome = self
            .store
            .process_fill(
                NewFill {
                    fill_id: Uuid::new_v4(),
                    exchange_trade_id: params.exchange_trade_id,
                    order_id: params.order_id,
                    symbol: params.symbol,
                    side: params.side,
                    price: params.price,
                    quantity: params.quantity,
                    fee: params.fee,
                    fee_asset: params.fee_asset,
                    liquidity: params.liquidity,
                    traded_at: params.traded_at,
                },
                now,
            )
            .await?;

        match outcome {
            ProcessFillOutcome::Applied(order) => Ok(Some(order)),
            ProcessFillOutcome::AlreadyProcessed => Ok(None),
            ProcessFillOutcome::NotFillable(status) => Err(ExecError::InvalidStateForFill { order_id, status }),
            ProcessFillOutcome::ExceedsQuantity => Err(ExecError::FillExceedsOrder { order_id, fill_qty }),
        }
    }
}
