//! Fill ingestor: the stateless bridge between the user-data stream and
//! the order state machine. Every execution report either carries a new
//! trade (`last_filled_qty > 0`) or is a pure status transition (order
//! rejected, canceled, expired with no additional fill).

use crate::adapter::stream::ExecutionReport;
use crate::domain::{Liquidity, OrderStatus, Side};
use crate::error::ExecError;
use crate::state_machine::{FillParams, OrderStateMachine};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

fn parse_side(raw: &str) -> Side {
    match raw {
        "SELL" => Side::Sell,
        _ => Side::Buy,
    }
}

fn parse_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "NEW" => Some(OrderStatus::Open),
        "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
        "FILLED" => Some(OrderStatus::Filled),
        "CANCELED" | "PENDING_CANCEL" => Some(OrderStatus::Canceled),
        "REJECTED" => Some(OrderStatus::Rejected),
        "EXPIRED" => Some(OrderStatus::Expired),
        _ => None,
    }
}

pub struct FillIngestor {
    state_machine: Arc<OrderStateMachine>,
    /// order_id keyed by exchange order id, populated by the admission
    /// façade at submission time so reports can be mapped back.
    order_lookup: Arc<dyn OrderLookup>,
}

#[async_trait::async_trait]
pub trait OrderLookup: Send + Sync {
    async fn order_id_for_exchange_id(&self, exchange_order_id: &str) -> Option<Uuid>;
}

impl FillIngestor {
    pub fn new(state_machine: Arc<OrderStateMachine>, order_lookup: Arc<dyn OrderLookup>) -> Self {
        Self {
            state_machine,
            order_lookup,
        }
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<ExecutionReport>) {
        while let Some(report) = rx.recv().await {
            if let Err(err) = self.handle_report(report).await {
                error!(error = %err, "failed to process execution report");
            }
        }
        info!("fill ingestor channel closed, stopping");
    }

    async fn handle_report(&self, report: ExecutionReport) -> Result<(), ExecError> {
        let order_id = match self.order_lookup.order_id_for_exchange_id(&report.exchange_order_id).await {
            Some(id) => id,
            None => {
                warn!(exchange_order_id = %report.exchange_order_id, "execution report for unknown order, dropping");
                return Ok(());
            }
        };

        let last_qty = Decimal::from_str(&report.last_filled_qty).unwrap_or_default();
        if last_qty > Decimal::ZERO {
            let params = FillParams {
                exchange_trade_id: report.trade_id.to_string(),
                order_id,
                symbol: report.symbol.clone(),
                side: parse_side(&report.side),
                price: Decimal::from_str(&report.last_filled_price).unwrap_or_default(),
                quantity: last_qty,
                fee: Decimal::from_str(&report.commission).unwrap_or_default(),
                fee_asset: report.commission_asset.clone(),
                liquidity: if report.is_maker { Liquidity::Maker } else { Liquidity::Taker },
                traded_at: chrono::DateTime::from_timestamp_millis(report.transaction_time)
                    .unwrap_or_else(chrono::Utc::now),
            };
            self.state_machine.process_fill(params).await?;
        } else if let Some(status) = parse_status(&report.order_status) {
            if matches!(status, OrderStatus::Open | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired) {
                let _ = self
                    .state_machine
                    .transition_order(order_id, status, Some(report.exchange_order_id.clone()), serde_json::json!({"source": "stream"}))
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, TimeInForce};
    use crate::state_machine::CreateOrderRequest;
    use crate::store::sqlite::SqliteStore;
    use rust_decimal_macros::dec;

    struct StaticLookup(Uuid);

    #[async_trait::async_trait]
    impl OrderLookup for StaticLookup {
        async fn order_id_for_exchange_id(&self, _exchange_order_id: &str) -> Option<Uuid> {
            Some(self.0)
        }
    }

    fn report(order_status: &str, last_filled_qty: &str, trade_id: i64) -> ExecutionReport {
        ExecutionReport {
            symbol: "BTCUSDT".into(),
            side: "BUY".into(),
            client_order_id: "c1".into(),
            exchange_order_id: "ex-1".into(),
            order_status: order_status.into(),
            last_filled_qty: last_filled_qty.into(),
            last_filled_price: "100".into(),
            trade_id,
            commission: "0.01".into(),
            commission_asset: "USDT".into(),
            is_maker: true,
            transaction_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn report_with_fill_quantity_processes_a_fill() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                time_in_force: TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(5),
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

        let ingestor = FillIngestor::new(state_machine, Arc::new(StaticLookup(order.order_id)));
        ingestor
            .handle_report(report("PARTIALLY_FILLED", "2", 1))
            .await
            .unwrap();

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.filled_quantity, dec!(2));
        assert_eq!(after.status, OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn terminal_status_with_no_fill_transitions_order() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                time_in_force: TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(5),
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

        let ingestor = FillIngestor::new(state_machine, Arc::new(StaticLookup(order.order_id)));
        ingestor.handle_report(report("CANCELED", "0", 0)).await.unwrap();

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn new_status_with_no_fill_acknowledges_submitted_order_as_open() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                time_in_force: TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(5),
                stop_price: None,
            })
            .await
            .unwrap();
        state_machine
            .transition_order(order.order_id, OrderStatus::Submitted, Some("ex-1".into()), serde_json::json!({}))
            .await
            .unwrap();

        let ingestor = FillIngestor::new(state_machine, Arc::new(StaticLookup(order.order_id)));
        ingestor.handle_report(report("NEW", "0", 0)).await.unwrap();

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Open);
    }
}
