//! Composition root: wires the durable store, exchange adapter, risk
//! validator, kill switch and admission façade together and runs the
//! three background loops (reconciliation, projector, user-data stream)
//! until shutdown.
//!
//! Plain CLI-args-then-build-the-dependency-graph-by-hand composition,
//! no DI framework: construct each collaborator once, pass `Arc`s down,
//! run until a signal arrives.

use clap::Parser;
use exec_core::adapter::rest::{RestAdapter, RestAdapterConfig};
use exec_core::adapter::stream::{StreamConfig, UserDataStream};
use exec_core::adapter::{CircuitBreakerConfig, ExchangeAdapter, RateLimiterConfig};
use exec_core::admission::AdmissionFacade;
use exec_core::config::Config;
use exec_core::fill_ingestor::{FillIngestor, OrderLookup};
use exec_core::kill_switch::KillSwitchRegistry;
use exec_core::projector::{PortfolioConfig, Projector};
use exec_core::reconciliation::{ReconciliationConfig, ReconciliationLoop};
use exec_core::risk::RiskValidator;
use exec_core::state_machine::OrderStateMachine;
use exec_core::store::sqlite::SqliteStore;
use exec_core::store::Store;
use exec_core::utils::init_logger;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "exec-server", about = "Execution core composition root")]
struct Args {
    #[arg(long, default_value = "config/exec.toml")]
    config: String,
}

/// Resolves an exchange order id back to the internal order id by
/// scanning the non-final orders table. A production deployment would
/// keep this index in the store; kept simple here since the lookup is
/// only on the stream's hot path and orders are short-lived once filled.
struct StoreOrderLookup {
    store: Arc<dyn Store>,
}

#[async_trait::async_trait]
impl OrderLookup for StoreOrderLookup {
    async fn order_id_for_exchange_id(&self, exchange_order_id: &str) -> Option<Uuid> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(2);
        let orders = self.store.non_final_orders_since(cutoff).await.ok()?;
        orders
            .into_iter()
            .find(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id))
            .map(|o| o.order_id)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    init_logger(&config.metrics.log_level, config.metrics.json_logs);

    info!("starting execution core");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database.path, config.database.busy_timeout_ms)?);

    let rest_config = RestAdapterConfig {
        base_url: config.exchange.rest_base_url.clone(),
        api_key: config.exchange.api_key.clone(),
        api_secret: config.exchange.api_secret.clone(),
        call_timeout: std::time::Duration::from_secs(10),
    };
    let rest = Arc::new(RestAdapter::new(
        rest_config,
        RateLimiterConfig {
            capacity: config.rate_limiter.capacity,
            refill_per_sec: config.rate_limiter.refill_per_sec,
            max_queue_size: config.rate_limiter.max_queue_size,
            max_wait_ms: config.rate_limiter.max_wait_ms,
        },
        CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            success_threshold: config.circuit_breaker.success_threshold,
            timeout: std::time::Duration::from_millis(config.circuit_breaker.timeout_ms),
            window_size: config.circuit_breaker.window_size,
        },
    ));
    let adapter: Arc<dyn ExchangeAdapter> = rest.clone();

    let kill_switch = Arc::new(KillSwitchRegistry::new(&config.redis.url)?);
    let risk_validator = Arc::new(RiskValidator::new(store.clone(), config.risk.approval_ttl_sec));
    let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
    // The HTTP surface that invokes `AdmissionFacade::place_order` lives
    // outside this crate; building it here just proves the dependency
    // graph wires together end to end.
    let _admission = Arc::new(AdmissionFacade::new(
        kill_switch.clone(),
        risk_validator.clone(),
        state_machine.clone(),
        adapter.clone(),
        &config.redis.url,
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reconciliation = Arc::new(ReconciliationLoop::new(
        store.clone(),
        adapter.clone(),
        state_machine.clone(),
        ReconciliationConfig {
            interval: std::time::Duration::from_millis(config.reconciliation.interval_ms),
            lookback: chrono::Duration::hours(config.reconciliation.lookback_hours),
            submission_timeout: chrono::Duration::milliseconds(config.reconciliation.submission_timeout_ms as i64),
        },
    ));
    let reconciliation_task = tokio::spawn({
        let reconciliation = reconciliation.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciliation.run_forever(shutdown_rx).await }
    });

    let projector = Arc::new(Projector::new(
        store.clone(),
        PortfolioConfig {
            poll_interval: std::time::Duration::from_millis(500),
            batch_size: config.portfolio.batch_size,
        },
    ));
    let projector_task = tokio::spawn({
        let projector = projector.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { projector.run_forever(shutdown_rx).await }
    });

    let (report_tx, report_rx) = tokio::sync::mpsc::channel(1024);
    let stream = Arc::new(UserDataStream::new(
        StreamConfig {
            ws_base_url: config.exchange.ws_base_url.clone(),
            ping_interval: std::time::Duration::from_millis(config.stream.ping_ms),
            reconnect_base: std::time::Duration::from_millis(config.stream.reconnect_base_ms),
            reconnect_max: std::time::Duration::from_millis(config.stream.reconnect_max_ms),
            connect_timeout: std::time::Duration::from_millis(config.stream.connect_timeout_ms),
            listen_key_refresh_interval: std::time::Duration::from_millis(config.stream.listen_key_refresh_ms),
        },
        rest.clone(),
    ));
    let stream_task = tokio::spawn({
        let stream = stream.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { stream.run(report_tx, shutdown_rx).await }
    });

    let ingestor = Arc::new(FillIngestor::new(state_machine.clone(), Arc::new(StoreOrderLookup { store: store.clone() })));
    let ingestor_task = tokio::spawn({
        let ingestor = ingestor.clone();
        async move { ingestor.run(report_rx).await }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received sigterm, shutting down"),
    }

    let _ = shutdown_tx.send(true);

    for (name, task) in [("reconciliation", reconciliation_task), ("projector", projector_task), ("stream", stream_task)] {
        if let Err(err) = task.await {
            error!(loop_name = name, error = %err, "background loop panicked");
        }
    }
    ingestor_task.abort();

    info!("execution core stopped");
    Ok(())
}
