//! Dumps one order's current state, event log and fills as JSON. Opens
//! the store directly, no server required, pretty-prints to stdout.

use clap::Parser;
use exec_core::store::sqlite::SqliteStore;
use exec_core::store::Store;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "dump-order", about = "Dump an order's state, events and fills")]
struct Args {
    #[arg(long, default_value = "exec.sqlite3")]
    db: String,

    /// Order id to dump.
    order_id: Uuid,
}

#[derive(Serialize)]
struct OrderDump {
    order: exec_core::domain::Order,
    events: Vec<exec_core::domain::OrderEvent>,
    fills: Vec<exec_core::domain::Fill>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&args.db, 5000)?);

    let order = store.get_order(args.order_id).await?;
    let events = store.list_events_by_order(args.order_id).await?;
    let fills = store.list_fills_by_order(args.order_id).await?;

    let dump = OrderDump { order, events, fills };
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
