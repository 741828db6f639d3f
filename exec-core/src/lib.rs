//! Execution core: the order state machine and durable event log, fill
//! ingestion, the exchange adapter, reconciliation, risk validation and
//! the kill switch, the portfolio projector, and the admission façade
//! that sequences them for inbound order requests.
//!
//! ## Modules
//! - [`domain`]: core entities (`Order`, `Fill`, `Position`, `RiskLimits`, ...).
//! - [`error`]: the crate-wide error enum and its API-facing projection.
//! - [`config`]: layered configuration (defaults, file, environment).
//! - [`store`]: the durable store trait and its SQLite implementation.
//! - [`state_machine`]: order lifecycle transitions and fill application.
//! - [`adapter`]: rate limiter, circuit breaker, REST client and user-data stream.
//! - [`fill_ingestor`]: bridges stream execution reports into the state machine.
//! - [`reconciliation`]: periodic local/exchange divergence sweep.
//! - [`projector`]: outbox-driven position projection under optimistic locking.
//! - [`risk`]: per-(user, symbol) admission risk checks with a TTL approval cache.
//! - [`kill_switch`]: cluster-visible trading halt switch.
//! - [`admission`]: the façade HTTP handlers call to place an order.

pub mod adapter;
pub mod admission;
pub mod config;
pub mod domain;
pub mod error;
pub mod fill_ingestor;
pub mod kill_switch;
pub mod projector;
pub mod reconciliation;
pub mod risk;
pub mod state_machine;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{ExecError, StoreError};

/// Prelude for convenient imports in binaries and tests.
pub mod prelude {
    pub use crate::admission::{AdmissionFacade, PlaceOrderRequest};
    pub use crate::config::Config;
    pub use crate::domain::{Fill, Order, OrderStatus, Position, RiskLimits, Side};
    pub use crate::error::{ExecError, StoreError};
    pub use crate::kill_switch::KillSwitchRegistry;
    pub use crate::projector::Projector;
    pub use crate::reconciliation::ReconciliationLoop;
    pub use crate::risk::RiskValidator;
    pub use crate::state_machine::OrderStateMachine;
    pub use crate::store::{sqlite::SqliteStore, Store};
}
