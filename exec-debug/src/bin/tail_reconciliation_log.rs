//! Prints the most recent reconciliation sweep entries, optionally
//! scoped to one order. Same open-the-store-directly idiom as
//! `dump-order`.

use clap::Parser;
use exec_core::store::sqlite::SqliteStore;
use exec_core::store::Store;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tail-reconciliation-log", about = "Show recent reconciliation log entries")]
struct Args {
    #[arg(long, default_value = "exec.sqlite3")]
    db: String,

    #[arg(long)]
    order_id: Option<Uuid>,

    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&args.db, 5000)?);

    let entries = store.list_reconciliation_log(args.order_id, args.limit).await?;
    if entries.is_empty() {
        println!("no reconciliation log entries");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} order={} action={}",
            entry.recorded_at.to_rfc3339(),
            entry.order_id,
            entry.action
        );
        println!("  before: {}", entry.before);
        println!("  after:  {}", entry.after);
    }
    Ok(())
}
