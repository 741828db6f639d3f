//! Portfolio projector: the single writer that turns outbox rows into
//! position updates, one (user, symbol) at a time, FIFO by creation order.
//!
//! A dedicated background loop draining bounded batches per tick, same
//! shape as the other background-writer loops in this crate: poll, process
//! a bounded batch, cooperatively drain on shutdown. Position updates go
//! through an optimistic version check so a concurrent writer's update
//! never gets silently clobbered.

use crate::domain::{OutboxRow, Side};
use crate::error::ExecError;
use crate::store::Store;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub poll_interval: std::time::Duration,
    pub batch_size: i64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProjectorStats {
    pub rows_processed: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub errors: AtomicU64,
}

/// Payload shape written to the outbox by `Store::process_fill` for
/// `FILL_PROCESSED` rows. Decimal/Uuid fields are carried as strings,
/// matching the TEXT-column convention the rest of the store uses.
#[derive(Debug, serde::Deserialize)]
struct FillProcessedPayload {
    user_id: Uuid,
    symbol: String,
    #[serde(deserialize_with = "deserialize_side")]
    side: Side,
    #[serde(deserialize_with = "deserialize_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    quantity: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    fee: Decimal,
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Decimal::from_str(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_side<'de, D>(deserializer: D) -> Result<Side, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(serde::de::Error::custom(format!("unknown side {other}"))),
    }
}

pub struct Projector {
    store: Arc<dyn Store>,
    config: PortfolioConfig,
    pub stats: ProjectorStats,
}

impl Projector {
    pub fn new(store: Arc<dyn Store>, config: PortfolioConfig) -> Self {
        Self {
            store,
            config,
            stats: ProjectorStats::default(),
        }
    }

    pub async fn run_forever(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "projector tick failed");
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

    /// Drains up to `batch_size` unprocessed outbox rows, applying each
    /// one's effect to the relevant position under optimistic-lock
    /// retry-next-tick semantics.
    pub async fn tick(&self) -> Result<usize, ExecError> {
        let rows = self.store.fetch_unprocessed_outbox(self.config.batch_size).await?;
        let mut processed = 0usize;
        for row in rows {
            match self.apply_row(&row).await {
                Ok(true) => {
                    processed += 1;
                    self.stats.rows_processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    self.stats.lock_conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(outbox_id = %row.outbox_id, "optimistic lock conflict, retrying next tick");
                }
                Err(err) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(outbox_id = %row.outbox_id, error = %err, "failed to apply outbox row");
                }
            }
        }
        Ok(processed)
    }

    async fn apply_row(&self, row: &OutboxRow) -> Result<bool, ExecError> {
        let now = chrono::Utc::now();

        if row.event_type == "ORDER_CANCELED" {
            self.store.mark_outbox_processed_no_effect(row.outbox_id, now).await?;
            return Ok(true);
        }

        if row.event_type != "FILL_PROCESSED" {
            warn!(event_type = %row.event_type, "unknown outbox event type, marking processed with no effect");
            self.store.mark_outbox_processed_no_effect(row.outbox_id, now).await?;
            return Ok(true);
        }

        let payload: FillProcessedPayload = serde_json::from_value(row.payload.clone())
            .map_err(|e| ExecError::ValidationError(format!("malformed outbox payload: {e}")))?;

        let mut position = self
            .store
            .get_or_create_position(payload.user_id, &payload.symbol, now)
            .await?;
        let expected_version = position.version;
        position.apply_fill(payload.side, payload.price, payload.quantity, payload.fee, now);

        match self
            .store
            .apply_outbox_row(row.outbox_id, position, expected_version, now)
            .await
        {
            Ok(()) => Ok(true),
            Err(crate::error::StoreError::Backend(msg)) if msg.contains("optimistic lock") => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Liquidity, OrderStatus, OrderType, TimeInForce};
    use crate::state_machine::{CreateOrderRequest, FillParams, OrderStateMachine};
    use crate::store::sqlite::SqliteStore;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn tick_applies_fill_processed_row_to_position() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = OrderStateMachine::new(store.clone());
        let user_id = Uuid::new_v4();

        let order = state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id,
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
        state_machine
            .process_fill(FillParams {
                exchange_trade_id: "t1".into(),
                order_id: order.order_id,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                price: dec!(100),
                quantity: dec!(5),
                fee: dec!(0.5),
                fee_asset: "USDT".into(),
                liquidity: Liquidity::Taker,
                traded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let projector = Projector::new(store.clone(), PortfolioConfig::default());
        let processed = projector.tick().await.unwrap();
        assert_eq!(processed, 1);

        let position = store.get_or_create_position(user_id, "BTCUSDT", chrono::Utc::now()).await.unwrap();
        assert_eq!(position.quantity, dec!(5));
        assert_eq!(position.avg_entry_price, dec!(100));
        assert_eq!(position.total_fees, dec!(0.5));

        // Re-running the tick must not double-apply the same outbox row.
        let processed_again = projector.tick().await.unwrap();
        assert_eq!(processed_again, 0);
    }
}
