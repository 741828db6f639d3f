//! SQLite-backed implementation of [`Store`]: a single shared connection
//! behind a mutex, opened once in WAL mode, schema created with
//! `CREATE TABLE IF NOT EXISTS`, driven off the async runtime via
//! `spawn_blocking` since `rusqlite::Connection` is blocking-only.

use super::{NewFill, NewOrder, ProcessFillOutcome, Store};
use crate::domain::{
    Fill, Liquidity, Order, OrderEvent, OrderEventType, OrderStatus, OrderType, OutboxRow, Position,
    ReconciliationLogEntry, RiskLimits, Side, TimeInForce,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("sqlite store initialized at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                price TEXT,
                stop_price TEXT,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                avg_fill_price TEXT NOT NULL,
                status TEXT NOT NULL,
                exchange_order_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS order_events (
                event_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE(order_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                exchange_trade_id TEXT NOT NULL UNIQUE,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                fee_asset TEXT NOT NULL,
                liquidity TEXT NOT NULL,
                traded_at TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS positions (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                data_as_of TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (user_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS portfolio_events_outbox (
                outbox_id TEXT PRIMARY KEY,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                published_at TEXT
            );

            CREATE TABLE IF NOT EXISTS order_reconciliation_log (
                log_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                action TEXT NOT NULL,
                before_state TEXT NOT NULL,
                after_state TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS risk_limits (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                max_position_size TEXT NOT NULL,
                max_exposure TEXT NOT NULL,
                max_daily_loss TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, symbol)
            );
            ",
        )?;
        Ok(())
    }
}

fn dec(s: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(s).map_err(|e| StoreError::Backend(format!("bad decimal '{s}': {e}")))
}

fn ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{s}': {e}")))
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}
fn side_parse(s: &str) -> Result<Side, StoreError> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(StoreError::Backend(format!("bad side '{other}'"))),
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::TakeProfit => "TAKE_PROFIT",
    }
}
fn order_type_parse(s: &str) -> Result<OrderType, StoreError> {
    match s {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" => Ok(OrderType::Limit),
        "STOP_LOSS" => Ok(OrderType::StopLoss),
        "TAKE_PROFIT" => Ok(OrderType::TakeProfit),
        other => Err(StoreError::Backend(format!("bad order_type '{other}'"))),
    }
}

fn tif_str(t: TimeInForce) -> &'static str {
    match t {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
    }
}
fn tif_parse(s: &str) -> Result<TimeInForce, StoreError> {
    match s {
        "GTC" => Ok(TimeInForce::Gtc),
        "IOC" => Ok(TimeInForce::Ioc),
        "FOK" => Ok(TimeInForce::Fok),
        other => Err(StoreError::Backend(format!("bad time_in_force '{other}'"))),
    }
}

fn status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::PendingNew => "PENDING_NEW",
        OrderStatus::Submitted => "SUBMITTED",
        OrderStatus::Open => "OPEN",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::PendingCancel => "PENDING_CANCEL",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::Rejected => "REJECTED",
        OrderStatus::Expired => "EXPIRED",
    }
}
fn status_parse(s: &str) -> Result<OrderStatus, StoreError> {
    Ok(match s {
        "PENDING_NEW" => OrderStatus::PendingNew,
        "SUBMITTED" => OrderStatus::Submitted,
        "OPEN" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "PENDING_CANCEL" => OrderStatus::PendingCancel,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        other => return Err(StoreError::Backend(format!("bad status '{other}'"))),
    })
}

fn event_type_for_status(status: OrderStatus) -> OrderEventType {
    match status {
        OrderStatus::PendingNew => OrderEventType::Created,
        OrderStatus::Submitted => OrderEventType::Submitted,
        OrderStatus::Open => OrderEventType::Opened,
        OrderStatus::PartiallyFilled => OrderEventType::PartiallyFilled,
        OrderStatus::Filled => OrderEventType::Filled,
        OrderStatus::PendingCancel => OrderEventType::CancelRequested,
        OrderStatus::Canceled => OrderEventType::Canceled,
        OrderStatus::Rejected => OrderEventType::Rejected,
        OrderStatus::Expired => OrderEventType::Expired,
    }
}

fn event_type_str(e: OrderEventType) -> &'static str {
    match e {
        OrderEventType::Created => "CREATED",
        OrderEventType::Submitted => "SUBMITTED",
        OrderEventType::Opened => "OPENED",
        OrderEventType::Rejected => "REJECTED",
        OrderEventType::PartiallyFilled => "PARTIAL_FILL",
        OrderEventType::Filled => "FILLED",
        OrderEventType::CancelRequested => "CANCEL_REQUESTED",
        OrderEventType::Canceled => "CANCELED",
        OrderEventType::Expired => "EXPIRED",
    }
}
fn event_type_parse(s: &str) -> Result<OrderEventType, StoreError> {
    Ok(match s {
        "CREATED" => OrderEventType::Created,
        "SUBMITTED" => OrderEventType::Submitted,
        "OPENED" => OrderEventType::Opened,
        "REJECTED" => OrderEventType::Rejected,
        "PARTIAL_FILL" => OrderEventType::PartiallyFilled,
        "FILLED" => OrderEventType::Filled,
        "CANCEL_REQUESTED" => OrderEventType::CancelRequested,
        "CANCELED" => OrderEventType::Canceled,
        "EXPIRED" => OrderEventType::Expired,
        other => return Err(StoreError::Backend(format!("bad event_type '{other}'"))),
    })
}

fn liquidity_str(l: Liquidity) -> &'static str {
    match l {
        Liquidity::Maker => "MAKER",
        Liquidity::Taker => "TAKER",
    }
}
fn liquidity_parse(s: &str) -> Result<Liquidity, StoreError> {
    match s {
        "MAKER" => Ok(Liquidity::Maker),
        "TAKER" => Ok(Liquidity::Taker),
        other => Err(StoreError::Backend(format!("bad liquidity '{other}'"))),
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<(Order, String)> {
    let status_s: String = row.get("status")?;
    let price_s: Option<String> = row.get("price")?;
    let stop_price_s: Option<String> = row.get("stop_price")?;
    let order_id: String = row.get("order_id")?;
    Ok((
        Order {
            order_id: Uuid::parse_str(&order_id).unwrap_or_default(),
            client_order_id: row.get("client_order_id")?,
            user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap_or_default(),
            symbol: row.get("symbol")?,
            side: side_parse(&row.get::<_, String>("side")?).unwrap_or(Side::Buy),
            order_type: order_type_parse(&row.get::<_, String>("order_type")?).unwrap_or(OrderType::Limit),
            time_in_force: tif_parse(&row.get::<_, String>("time_in_force")?).unwrap_or(TimeInForce::Gtc),
            price: price_s.map(|s| dec(&s).unwrap_or_default()),
            stop_price: stop_price_s.map(|s| dec(&s).unwrap_or_default()),
            quantity: dec(&row.get::<_, String>("quantity")?).unwrap_or_default(),
            filled_quantity: dec(&row.get::<_, String>("filled_quantity")?).unwrap_or_default(),
            avg_fill_price: dec(&row.get::<_, String>("avg_fill_price")?).unwrap_or_default(),
            status: status_parse(&status_s).unwrap_or(OrderStatus::PendingNew),
            exchange_order_id: row.get("exchange_order_id")?,
            created_at: ts(&row.get::<_, String>("created_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
            updated_at: ts(&row.get::<_, String>("updated_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
            version: row.get("version")?,
        },
        status_s,
    ))
}

fn row_to_fill(row: &rusqlite::Row) -> rusqlite::Result<Fill> {
    Ok(Fill {
        fill_id: Uuid::parse_str(&row.get::<_, String>("fill_id")?).unwrap_or_default(),
        exchange_trade_id: row.get("exchange_trade_id")?,
        order_id: Uuid::parse_str(&row.get::<_, String>("order_id")?).unwrap_or_default(),
        symbol: row.get("symbol")?,
        side: side_parse(&row.get::<_, String>("side")?).unwrap_or(Side::Buy),
        price: dec(&row.get::<_, String>("price")?).unwrap_or_default(),
        quantity: dec(&row.get::<_, String>("quantity")?).unwrap_or_default(),
        fee: dec(&row.get::<_, String>("fee")?).unwrap_or_default(),
        fee_asset: row.get("fee_asset")?,
        liquidity: liquidity_parse(&row.get::<_, String>("liquidity")?).unwrap_or(Liquidity::Taker),
        traded_at: ts(&row.get::<_, String>("traded_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        ingested_at: ts(&row.get::<_, String>("ingested_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
    })
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    Ok(Position {
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap_or_default(),
        symbol: row.get("symbol")?,
        quantity: dec(&row.get::<_, String>("quantity")?).unwrap_or_default(),
        avg_entry_price: dec(&row.get::<_, String>("avg_entry_price")?).unwrap_or_default(),
        realized_pnl: dec(&row.get::<_, String>("realized_pnl")?).unwrap_or_default(),
        total_fees: dec(&row.get::<_, String>("total_fees")?).unwrap_or_default(),
        data_as_of: ts(&row.get::<_, String>("data_as_of")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        version: row.get("version")?,
    })
}

fn row_to_outbox(row: &rusqlite::Row) -> rusqlite::Result<OutboxRow> {
    let payload_s: String = row.get("payload")?;
    let published_s: Option<String> = row.get("published_at")?;
    Ok(OutboxRow {
        outbox_id: Uuid::parse_str(&row.get::<_, String>("outbox_id")?).unwrap_or_default(),
        aggregate_type: row.get("aggregate_type")?,
        aggregate_id: Uuid::parse_str(&row.get::<_, String>("aggregate_id")?).unwrap_or_default(),
        event_type: row.get("event_type")?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
        created_at: ts(&row.get::<_, String>("created_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        published_at: published_s.and_then(|s| ts(&s).ok()),
    })
}

fn row_to_reconciliation_log(row: &rusqlite::Row) -> rusqlite::Result<ReconciliationLogEntry> {
    let before_s: String = row.get("before_state")?;
    let after_s: String = row.get("after_state")?;
    Ok(ReconciliationLogEntry {
        log_id: Uuid::parse_str(&row.get::<_, String>("log_id")?).unwrap_or_default(),
        order_id: Uuid::parse_str(&row.get::<_, String>("order_id")?).unwrap_or_default(),
        action: row.get("action")?,
        before: serde_json::from_str(&before_s).unwrap_or(serde_json::Value::Null),
        after: serde_json::from_str(&after_s).unwrap_or(serde_json::Value::Null),
        recorded_at: ts(&row.get::<_, String>("recorded_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
    })
}

fn row_to_risk_limits(row: &rusqlite::Row) -> rusqlite::Result<RiskLimits> {
    Ok(RiskLimits {
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap_or_default(),
        symbol: row.get("symbol")?,
        max_position_size: dec(&row.get::<_, String>("max_position_size")?).unwrap_or_default(),
        max_exposure: dec(&row.get::<_, String>("max_exposure")?).unwrap_or_default(),
        max_daily_loss: dec(&row.get::<_, String>("max_daily_loss")?).unwrap_or_default(),
        updated_at: ts(&row.get::<_, String>("updated_at")?).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
    })
}

fn next_sequence(conn: &Connection, order_id: Uuid) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM order_events WHERE order_id = ?1",
        params![order_id.to_string()],
        |row| row.get(0),
    )
}

macro_rules! blocking {
    ($self:ident, $body:expr) => {{
        let conn = $self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            $body(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }};
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_order(&self, new_order: NewOrder, now: DateTime<Utc>) -> Result<Order, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Order, StoreError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                conn.execute(
                    "INSERT INTO orders (order_id, client_order_id, user_id, symbol, side, order_type,
                        time_in_force, price, stop_price, quantity, filled_quantity, avg_fill_price, status,
                        exchange_order_id, created_at, updated_at, version)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,'0','0',?11,NULL,?12,?12,1)",
                    params![
                        new_order.order_id.to_string(),
                        new_order.client_order_id,
                        new_order.user_id.to_string(),
                        new_order.symbol,
                        side_str(new_order.side),
                        order_type_str(new_order.order_type),
                        tif_str(new_order.time_in_force),
                        new_order.price.map(|p| p.to_string()),
                        new_order.stop_price.map(|p| p.to_string()),
                        new_order.quantity.to_string(),
                        status_str(OrderStatus::PendingNew),
                        now.to_rfc3339(),
                    ],
                )?;

                let payload = serde_json::json!({
                    "quantity": new_order.quantity.to_string(),
                    "price": new_order.price.map(|p| p.to_string()),
                    "stop_price": new_order.stop_price.map(|p| p.to_string()),
                });
                conn.execute(
                    "INSERT INTO order_events (event_id, order_id, sequence, event_type, payload, recorded_at)
                     VALUES (?1,?2,1,?3,?4,?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        new_order.order_id.to_string(),
                        event_type_str(OrderEventType::Created),
                        payload.to_string(),
                        now.to_rfc3339(),
                    ],
                )?;
                Ok::<(), StoreError>(())
            })();

            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(e);
                }
            }

            let (order, _) = conn.query_row(
                "SELECT * FROM orders WHERE order_id = ?1",
                params![new_order.order_id.to_string()],
                row_to_order,
            )?;
            Ok(order)
        })
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Order, StoreError> {
            let (order, _) = conn.query_row(
                "SELECT * FROM orders WHERE order_id = ?1",
                params![order_id.to_string()],
                row_to_order,
            )?;
            Ok(order)
        })
    }

    async fn list_orders_by_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<Order>, StoreError> {
            let mut stmt = conn.prepare("SELECT * FROM orders WHERE user_id = ?1 ORDER BY created_at ASC")?;
            let rows = stmt
                .query_map(params![user_id.to_string()], row_to_order)?
                .map(|r| r.map(|(o, _)| o).map_err(StoreError::from))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn list_fills_by_order(&self, order_id: Uuid) -> Result<Vec<Fill>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<Fill>, StoreError> {
            let mut stmt = conn.prepare("SELECT * FROM fills WHERE order_id = ?1 ORDER BY traded_at ASC")?;
            let rows = stmt
                .query_map(params![order_id.to_string()], row_to_fill)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn list_events_by_order(&self, order_id: Uuid) -> Result<Vec<OrderEvent>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<OrderEvent>, StoreError> {
            let mut stmt = conn.prepare("SELECT * FROM order_events WHERE order_id = ?1 ORDER BY sequence ASC")?;
            let rows = stmt
                .query_map(params![order_id.to_string()], |row| {
                    let payload_s: String = row.get("payload")?;
                    Ok(OrderEvent {
                        event_id: Uuid::parse_str(&row.get::<_, String>("event_id")?).unwrap_or_default(),
                        order_id: Uuid::parse_str(&row.get::<_, String>("order_id")?).unwrap_or_default(),
                        sequence: row.get("sequence")?,
                        event_type: event_type_parse(&row.get::<_, String>("event_type")?)
                            .unwrap_or(OrderEventType::Created),
                        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
                        recorded_at: ts(&row.get::<_, String>("recorded_at")?)
                            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        exchange_order_id: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Order, StoreError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                if let Some(ref exch_id) = exchange_order_id {
                    conn.execute(
                        "UPDATE orders SET status = ?1, exchange_order_id = COALESCE(exchange_order_id, ?2),
                         updated_at = ?3, version = version + 1 WHERE order_id = ?4",
                        params![status_str(new_status), exch_id, now.to_rfc3339(), order_id.to_string()],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE orders SET status = ?1, updated_at = ?2, version = version + 1 WHERE order_id = ?3",
                        params![status_str(new_status), now.to_rfc3339(), order_id.to_string()],
                    )?;
                }

                let next_seq = next_sequence(conn, order_id)?;
                conn.execute(
                    "INSERT INTO order_events (event_id, order_id, sequence, event_type, payload, recorded_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        order_id.to_string(),
                        next_seq,
                        event_type_str(event_type_for_status(new_status)),
                        metadata.to_string(),
                        now.to_rfc3339(),
                    ],
                )?;
                Ok::<(), StoreError>(())
            })();

            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(e);
                }
            }

            let (order, _) = conn.query_row(
                "SELECT * FROM orders WHERE order_id = ?1",
                params![order_id.to_string()],
                row_to_order,
            )?;
            Ok(order)
        })
    }

    async fn process_fill(&self, fill: NewFill, now: DateTime<Utc>) -> Result<ProcessFillOutcome, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<ProcessFillOutcome, StoreError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;

            let insert_result = conn.execute(
                "INSERT INTO fills (fill_id, exchange_trade_id, order_id, symbol, side, price, quantity,
                    fee, fee_asset, liquidity, traded_at, ingested_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    fill.fill_id.to_string(),
                    fill.exchange_trade_id,
                    fill.order_id.to_string(),
                    fill.symbol,
                    side_str(fill.side),
                    fill.price.to_string(),
                    fill.quantity.to_string(),
                    fill.fee.to_string(),
                    fill.fee_asset,
                    liquidity_str(fill.liquidity),
                    fill.traded_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            );

            match insert_result {
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Ok(ProcessFillOutcome::AlreadyProcessed);
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(e.into());
                }
                Ok(_) => {}
            }

            let result = (|| -> Result<Option<ProcessFillOutcome>, StoreError> {
                let (order, status_s) = conn.query_row(
                    "SELECT * FROM orders WHERE order_id = ?1",
                    params![fill.order_id.to_string()],
                    row_to_order,
                )?;
                let status = status_parse(&status_s)?;
                if !status.is_fillable() {
                    return Ok(Some(ProcessFillOutcome::NotFillable(status)));
                }

                let new_filled = order.filled_quantity + fill.quantity;
                if new_filled > order.quantity {
                    return Ok(Some(ProcessFillOutcome::ExceedsQuantity));
                }

                let new_avg = if order.filled_quantity == Decimal::ZERO {
                    fill.price
                } else {
                    (order.avg_fill_price * order.filled_quantity + fill.price * fill.quantity) / new_filled
                };
                let new_status = if new_filled == order.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };

                let next_seq = next_sequence(conn, fill.order_id)?;
                let payload = serde_json::json!({
                    "fill_id": fill.fill_id.to_string(),
                    "price": fill.price.to_string(),
                    "quantity": fill.quantity.to_string(),
                    "fee": fill.fee.to_string(),
                    "fee_asset": fill.fee_asset,
                    "filled_quantity": new_filled.to_string(),
                    "avg_fill_price": new_avg.to_string(),
                });
                conn.execute(
                    "INSERT INTO order_events (event_id, order_id, sequence, event_type, payload, recorded_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        fill.order_id.to_string(),
                        next_seq,
                        event_type_str(event_type_for_status(new_status)),
                        payload.to_string(),
                        now.to_rfc3339(),
                    ],
                )?;

                conn.execute(
                    "UPDATE orders SET status = ?1, filled_quantity = ?2, avg_fill_price = ?3, updated_at = ?4,
                     version = version + 1 WHERE order_id = ?5",
                    params![
                        status_str(new_status),
                        new_filled.to_string(),
                        new_avg.to_string(),
                        now.to_rfc3339(),
                        fill.order_id.to_string(),
                    ],
                )?;

                let outbox_payload = serde_json::json!({
                    "fill_id": fill.fill_id.to_string(),
                    "order_id": fill.order_id.to_string(),
                    "symbol": fill.symbol,
                    "side": side_str(fill.side),
                    "price": fill.price.to_string(),
                    "quantity": fill.quantity.to_string(),
                    "fee": fill.fee.to_string(),
                    "user_id": order.user_id.to_string(),
                });
                conn.execute(
                    "INSERT INTO portfolio_events_outbox (outbox_id, aggregate_type, aggregate_id, event_type,
                        payload, created_at, published_at)
                     VALUES (?1,'order',?2,'FILL_PROCESSED',?3,?4,NULL)",
                    params![
                        Uuid::new_v4().to_string(),
                        fill.order_id.to_string(),
                        outbox_payload.to_string(),
                        now.to_rfc3339(),
                    ],
                )?;

                Ok(None)
            })();

            match result {
                Ok(None) => conn.execute_batch("COMMIT")?,
                Ok(Some(rejected)) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Ok(rejected);
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(e);
                }
            }

            let (order, _) = conn.query_row(
                "SELECT * FROM orders WHERE order_id = ?1",
                params![fill.order_id.to_string()],
                row_to_order,
            )?;
            Ok(ProcessFillOutcome::Applied(order))
        })
    }

    async fn non_final_orders_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<Order>, StoreError> {
            let mut stmt = conn.prepare(
                "SELECT * FROM orders WHERE created_at >= ?1
                 AND status IN ('PENDING_NEW','OPEN','PARTIALLY_FILLED','PENDING_CANCEL')
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![cutoff.to_rfc3339()], row_to_order)?
                .map(|r| r.map(|(o, _)| o).map_err(StoreError::from))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn append_reconciliation_log(
        &self,
        order_id: Uuid,
        action: &str,
        before: serde_json::Value,
        after: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let action = action.to_string();
        blocking!(self, move |conn: &Connection| -> Result<(), StoreError> {
            conn.execute(
                "INSERT INTO order_reconciliation_log (log_id, order_id, action, before_state, after_state, recorded_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    Uuid::new_v4().to_string(),
                    order_id.to_string(),
                    action,
                    before.to_string(),
                    after.to_string(),
                    now.to_rfc3339(),
                ],
            )?;
            debug!(%order_id, %action, "reconciliation log appended");
            Ok(())
        })
    }

    async fn list_reconciliation_log(&self, order_id: Option<Uuid>, limit: i64) -> Result<Vec<ReconciliationLogEntry>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<ReconciliationLogEntry>, StoreError> {
            let rows = match order_id {
                Some(order_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM order_reconciliation_log WHERE order_id = ?1 ORDER BY recorded_at DESC LIMIT ?2",
                    )?;
                    stmt.query_map(params![order_id.to_string(), limit], row_to_reconciliation_log)?
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM order_reconciliation_log ORDER BY recorded_at DESC LIMIT ?1")?;
                    stmt.query_map(params![limit], row_to_reconciliation_log)?
                        .collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
    }

    async fn fetch_unprocessed_outbox(&self, limit: i64) -> Result<Vec<OutboxRow>, StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<Vec<OutboxRow>, StoreError> {
            let mut stmt = conn.prepare(
                "SELECT * FROM portfolio_events_outbox WHERE published_at IS NULL
                 ORDER BY created_at ASC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], row_to_outbox)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn get_or_create_position(&self, user_id: Uuid, symbol: &str, now: DateTime<Utc>) -> Result<Position, StoreError> {
        let symbol = symbol.to_string();
        blocking!(self, move |conn: &Connection| -> Result<Position, StoreError> {
            let existing = conn
                .query_row(
                    "SELECT * FROM positions WHERE user_id = ?1 AND symbol = ?2",
                    params![user_id.to_string(), symbol],
                    row_to_position,
                )
                .optional()?;
            if let Some(position) = existing {
                return Ok(position);
            }

            let position = Position::flat(user_id, symbol.clone(), now);
            conn.execute(
                "INSERT INTO positions (user_id, symbol, quantity, avg_entry_price, realized_pnl, total_fees,
                    data_as_of, version) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    user_id.to_string(),
                    symbol,
                    position.quantity.to_string(),
                    position.avg_entry_price.to_string(),
                    position.realized_pnl.to_string(),
                    position.total_fees.to_string(),
                    position.data_as_of.to_rfc3339(),
                    position.version,
                ],
            )?;
            Ok(position)
        })
    }

    async fn apply_outbox_row(
        &self,
        outbox_id: Uuid,
        updated_position: Position,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<(), StoreError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| {
                let current_version: i64 = conn.query_row(
                    "SELECT version FROM positions WHERE user_id = ?1 AND symbol = ?2",
                    params![updated_position.user_id.to_string(), updated_position.symbol],
                    |row| row.get(0),
                )?;
                if current_version != expected_version {
                    return Err(StoreError::Backend(format!(
                        "optimistic lock failed: expected {expected_version}, found {current_version}"
                    )));
                }

                conn.execute(
                    "UPDATE positions SET quantity = ?1, avg_entry_price = ?2, realized_pnl = ?3, total_fees = ?4,
                     data_as_of = ?5, version = ?6 WHERE user_id = ?7 AND symbol = ?8",
                    params![
                        updated_position.quantity.to_string(),
                        updated_position.avg_entry_price.to_string(),
                        updated_position.realized_pnl.to_string(),
                        updated_position.total_fees.to_string(),
                        updated_position.data_as_of.to_rfc3339(),
                        updated_position.version,
                        updated_position.user_id.to_string(),
                        updated_position.symbol,
                    ],
                )?;

                conn.execute(
                    "UPDATE portfolio_events_outbox SET published_at = ?1 WHERE outbox_id = ?2",
                    params![now.to_rfc3339(), outbox_id.to_string()],
                )?;
                Ok::<(), StoreError>(())
            })();

            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    async fn mark_outbox_processed_no_effect(&self, outbox_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<(), StoreError> {
            conn.execute(
                "UPDATE portfolio_events_outbox SET published_at = ?1 WHERE outbox_id = ?2",
                params![now.to_rfc3339(), outbox_id.to_string()],
            )?;
            Ok(())
        })
    }

    async fn get_risk_limits(&self, user_id: Uuid, symbol: &str) -> Result<Option<RiskLimits>, StoreError> {
        let symbol = symbol.to_string();
        blocking!(self, move |conn: &Connection| -> Result<Option<RiskLimits>, StoreError> {
            let specific = conn
                .query_row(
                    "SELECT * FROM risk_limits WHERE user_id = ?1 AND symbol = ?2",
                    params![user_id.to_string(), symbol],
                    row_to_risk_limits,
                )
                .optional()?;
            if specific.is_some() {
                return Ok(specific);
            }
            let default_row = conn
                .query_row(
                    "SELECT * FROM risk_limits WHERE user_id = ?1 AND symbol = '*'",
                    params![user_id.to_string()],
                    row_to_risk_limits,
                )
                .optional()?;
            Ok(default_row)
        })
    }

    async fn upsert_risk_limits(&self, limits: RiskLimits) -> Result<(), StoreError> {
        blocking!(self, move |conn: &Connection| -> Result<(), StoreError> {
            conn.execute(
                "INSERT INTO risk_limits (user_id, symbol, max_position_size, max_exposure, max_daily_loss, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(user_id, symbol) DO UPDATE SET
                    max_position_size = excluded.max_position_size,
                    max_exposure = excluded.max_exposure,
                    max_daily_loss = excluded.max_daily_loss,
                    updated_at = excluded.updated_at",
                params![
                    limits.user_id.to_string(),
                    limits.symbol,
                    limits.max_position_size.to_string(),
                    limits.max_exposure.to_string(),
                    limits.max_daily_loss.to_string(),
                    limits.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, Side, TimeInForce};
    use rust_decimal_macros::dec;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn create_order_persists_order_and_created_event() {
        let store = store();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let order = store
            .create_order(
                NewOrder {
                    order_id,
                    client_order_id: "c1".into(),
                    user_id: Uuid::new_v4(),
                    symbol: "BTCUSDT".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    time_in_force: TimeInForce::Gtc,
                    price: Some(dec!(100)),
                    quantity: dec!(5),
                    stop_price: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingNew);

        let events = store.list_events_by_order(order_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[0].event_type, OrderEventType::Created);
    }

    #[tokio::test]
    async fn duplicate_fill_is_idempotent() {
        let store = store();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .create_order(
                NewOrder {
                    order_id,
                    client_order_id: "c1".into(),
                    user_id: Uuid::new_v4(),
                    symbol: "BTCUSDT".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    time_in_force: TimeInForce::Gtc,
                    price: Some(dec!(100)),
                    quantity: dec!(5),
                    stop_price: None,
                },
                now,
            )
            .await
            .unwrap();
        store
            .transition_order(order_id, OrderStatus::Open, Some("ex1".into()), serde_json::json!({}), now)
            .await
            .unwrap();

        let fill = NewFill {
            fill_id: Uuid::new_v4(),
            exchange_trade_id: "trade-1".into(),
            order_id,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: dec!(100),
            quantity: dec!(5),
            fee: dec!(0.1),
            fee_asset: "USDT".into(),
            liquidity: Liquidity::Taker,
            traded_at: now,
        };

        let first = store.process_fill(fill.clone(), now).await.unwrap();
        assert!(matches!(first, ProcessFillOutcome::Applied(_)));

        let second = store.process_fill(fill, now).await.unwrap();
        assert!(matches!(second, ProcessFillOutcome::AlreadyProcessed));

        let order = store.get_order(order_id).await.unwrap();
        assert_eq!(order.filled_quantity, dec!(5));
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn risk_limits_precedence_prefers_symbol_specific() {
        let store = store();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .upsert_risk_limits(RiskLimits {
                user_id,
                symbol: "*".into(),
                max_position_size: dec!(10),
                max_exposure: dec!(1000),
                max_daily_loss: dec!(500),
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .upsert_risk_limits(RiskLimits {
                user_id,
                symbol: "BTCUSDT".into(),
                max_position_size: dec!(2),
                max_exposure: dec!(1000),
                max_daily_loss: dec!(500),
                updated_at: now,
            })
            .await
            .unwrap();

        let resolved = store.get_risk_limits(user_id, "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(resolved.max_position_size, dec!(2));

        let fallback = store.get_risk_limits(user_id, "ETHUSDT").await.unwrap().unwrap();
        assert_eq!(fallback.max_position_size, dec!(10));
    }

    #[tokio::test]
    async fn reconciliation_log_filters_by_order_and_orders_newest_first() {
        let store = store();
        let order_a = Uuid::new_v4();
        let order_b = Uuid::new_v4();
        let now = Utc::now();

        store
            .append_reconciliation_log(order_a, "NO_CHANGE", serde_json::json!({"n": 1}), serde_json::json!({"n": 1}), now)
            .await
            .unwrap();
        store
            .append_reconciliation_log(order_b, "STATE_UPDATED", serde_json::json!({"n": 2}), serde_json::json!({"n": 3}), now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .append_reconciliation_log(order_a, "FILLS_ADDED", serde_json::json!({"n": 4}), serde_json::json!({"n": 5}), now + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let all = store.list_reconciliation_log(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, "FILLS_ADDED", "newest entry must come first");

        let only_a = store.list_reconciliation_log(Some(order_a), 10).await.unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|e| e.order_id == order_a));

        let limited = store.list_reconciliation_log(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].action, "FILLS_ADDED");
    }
}
