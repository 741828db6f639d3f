//! Admission façade: the single entry point an HTTP handler (outside this
//! crate's scope) calls to place an order. Sequences the kill-switch
//! check, risk validation, durable order creation and best-effort
//! exchange submission, and deduplicates retried requests via a
//! short-TTL Redis-backed idempotency cache.

use crate::adapter::{ExchangeAdapter, PlaceOrderRequest as AdapterPlaceOrderRequest};
use crate::domain::{Order, OrderStatus, OrderType, Side, TimeInForce};
use crate::error::ExecError;
use crate::kill_switch::KillSwitchGate;
use crate::risk::{ApprovalRequest, RiskValidator};
use crate::state_machine::{CreateOrderRequest, OrderStateMachine};
use async_trait::async_trait;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const IDEMPOTENCY_PREFIX: &str = "idempotency:";
const IDEMPOTENCY_TTL_SECS: u64 = 86_400;

/// Idempotency side-store keyed by the caller-supplied idempotency key,
/// implemented by [`RedisIdempotencyStore`] against the real cache. Lets
/// `AdmissionFacade` be driven in tests without a live Redis.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Order>, ExecError>;
    async fn store(&self, key: &str, order: &Order) -> Result<(), ExecError>;
}

pub struct RedisIdempotencyStore {
    client: redis::Client,
}

impl RedisIdempotencyStore {
    pub fn new(redis_url: &str) -> Result<Self, ExecError> {
        let client = redis::Client::open(redis_url).map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn lookup(&self, key: &str) -> Result<Option<Order>, ExecError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        let raw: Option<String> = conn
            .get(format!("{IDEMPOTENCY_PREFIX}{key}"))
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(json) => {
                let order = serde_json::from_str(&json)
                    .map_err(|e| ExecError::KillSwitchRegistry(format!("corrupt idempotency entry: {e}")))?;
                info!(idempotency_key = key, "returning cached response for repeated admission request");
                Ok(Some(order))
            }
        }
    }

    async fn store(&self, key: &str, order: &Order) -> Result<(), ExecError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        let json = serde_json::to_string(order).map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        conn.set_ex::<_, _, ()>(format!("{IDEMPOTENCY_PREFIX}{key}"), json, IDEMPOTENCY_TTL_SECS)
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub client_order_id: String,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub current_position: Decimal,
    pub position_version: i64,
}

pub struct AdmissionFacade {
    kill_switch: Arc<dyn KillSwitchGate>,
    risk_validator: Arc<RiskValidator>,
    state_machine: Arc<OrderStateMachine>,
    adapter: Arc<dyn ExchangeAdapter>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl AdmissionFacade {
    pub fn new(
        kill_switch: Arc<dyn KillSwitchGate>,
        risk_validator: Arc<RiskValidator>,
        state_machine: Arc<OrderStateMachine>,
        adapter: Arc<dyn ExchangeAdapter>,
        redis_url: &str,
    ) -> Result<Self, ExecError> {
        let idempotency = Arc::new(RedisIdempotencyStore::new(redis_url)?);
        Ok(Self::with_deps(kill_switch, risk_validator, state_machine, adapter, idempotency))
    }

    /// Same wiring as `new`, but the kill-switch gate and idempotency
    /// store are injected directly, so `place_order` can be exercised
    /// against fakes without a live Redis.
    pub fn with_deps(
        kill_switch: Arc<dyn KillSwitchGate>,
        risk_validator: Arc<RiskValidator>,
        state_machine: Arc<OrderStateMachine>,
        adapter: Arc<dyn ExchangeAdapter>,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self {
            kill_switch,
            risk_validator,
            state_machine,
            adapter,
            idempotency,
        }
    }

    pub async fn place_order(&self, req: PlaceOrderRequest, idempotency_key: &str) -> Result<Order, ExecError> {
        if let Some(cached) = self.idempotency.lookup(idempotency_key).await? {
            return Ok(cached);
        }

        self.kill_switch.check_or_fail().await?;

        self.risk_validator
            .validate(ApprovalRequest {
                user_id: req.user_id,
                symbol: req.symbol.clone(),
                side: req.side,
                quantity: req.quantity,
                current_position: req.current_position,
                position_version: req.position_version,
            })
            .await?;

        let order = self
            .state_machine
            .create_order(CreateOrderRequest {
                client_order_id: req.client_order_id.clone(),
                user_id: req.user_id,
                symbol: req.symbol.clone(),
                side: req.side,
                order_type: req.order_type,
                time_in_force: req.time_in_force,
                price: req.price,
                stop_price: req.stop_price,
                quantity: req.quantity,
            })
            .await?;

        self.idempotency.store(idempotency_key, &order).await?;
        info!(idempotency_key, order_id = %order.order_id, "admitted new order");

        // Step 4 is explicitly best-effort and asynchronous with respect
        // to this call: the order already exists durably, so submission
        // runs in the background and reconciliation is the backstop for
        // a lost acknowledgement.
        let order_id = order.order_id;
        let place = AdapterPlaceOrderRequest {
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            time_in_force: req.time_in_force,
            quantity: req.quantity,
            price: req.price,
            stop_price: req.stop_price,
            client_order_id: req.client_order_id.clone(),
        };
        let adapter = self.adapter.clone();
        let state_machine = self.state_machine.clone();
        tokio::spawn(async move {
            submit_to_exchange(adapter, state_machine, order_id, place).await;
        });

        Ok(order)
    }
}

/// Best-effort submission. A failure here only transitions the order to
/// REJECTED; it never surfaces to the caller of `place_order`, since the
/// order already exists durably and reconciliation covers lost
/// acknowledgements. Success moves the order to SUBMITTED, not OPEN: the
/// exchange has accepted the request, but the order isn't resting on the
/// book until the user-data stream (or reconciliation) confirms it.
async fn submit_to_exchange(
    adapter: Arc<dyn ExchangeAdapter>,
    state_machine: Arc<OrderStateMachine>,
    order_id: Uuid,
    place: AdapterPlaceOrderRequest,
) {
    match adapter.place_order(place).await {
        Ok(response) => {
            if let Err(err) = state_machine
                .transition_order(order_id, OrderStatus::Submitted, Some(response.exchange_order_id), serde_json::json!({}))
                .await
            {
                error!(order_id = %order_id, error = %err, "failed to record exchange acknowledgement");
            }
        }
        Err(err) => {
            warn!(order_id = %order_id, error = %err, "order submission failed, marking rejected");
            if let Err(transition_err) = state_machine
                .transition_order(order_id, OrderStatus::Rejected, None, serde_json::json!({"reason": err.to_string()}))
                .await
            {
                error!(order_id = %order_id, error = %transition_err, "failed to mark order rejected after submission failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ExchangeOrderStatus, ExchangeTrade};
    use crate::domain::RiskLimits;
    use crate::state_machine::CreateOrderRequest;
    use crate::store::sqlite::SqliteStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct AlwaysOpen;

    #[async_trait]
    impl KillSwitchGate for AlwaysOpen {
        async fn check_or_fail(&self) -> Result<(), ExecError> {
            Ok(())
        }
    }

    struct AlwaysBlocked;

    #[async_trait]
    impl KillSwitchGate for AlwaysBlocked {
        async fn check_or_fail(&self) -> Result<(), ExecError> {
            Err(ExecError::KillSwitchActive {
                reason: "manual halt".into(),
                activated_at: chrono::Utc::now(),
            })
        }
    }

    #[derive(Default)]
    struct FakeIdempotencyStore {
        entries: Mutex<HashMap<String, Order>>,
    }

    #[async_trait]
    impl IdempotencyStore for FakeIdempotencyStore {
        async fn lookup(&self, key: &str) -> Result<Option<Order>, ExecError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn store(&self, key: &str, order: &Order) -> Result<(), ExecError> {
            self.entries.lock().unwrap().insert(key.to_string(), order.clone());
            Ok(())
        }
    }

    fn place_request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            client_order_id: "c1".into(),
            user_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            price: Some(dec!(100)),
            stop_price: None,
            quantity: dec!(1),
            current_position: dec!(0),
            position_version: 1,
        }
    }

    struct AcceptingAdapter;

    #[async_trait]
    impl ExchangeAdapter for AcceptingAdapter {
        async fn place_order(&self, _req: AdapterPlaceOrderRequest) -> Result<crate::adapter::PlaceOrderResponse, ExecError> {
            Ok(crate::adapter::PlaceOrderResponse { exchange_order_id: "ex-1".into() })
        }
        async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn query_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError> {
            unimplemented!()
        }
        async fn list_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError> {
            Ok(vec![])
        }
        async fn list_order_trades(&self, _symbol: &str, _exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError> {
            Ok(vec![])
        }
        async fn get_listen_key(&self) -> Result<String, ExecError> {
            Ok("key".into())
        }
        async fn keep_alive_listen_key(&self, _key: &str) -> Result<(), ExecError> {
            Ok(())
        }
    }

    struct RejectingAdapter;

    #[async_trait]
    impl ExchangeAdapter for RejectingAdapter {
        async fn place_order(&self, _req: AdapterPlaceOrderRequest) -> Result<crate::adapter::PlaceOrderResponse, ExecError> {
            Err(ExecError::ExchangeApiError {
                code: "INSUFFICIENT_BALANCE".into(),
                message: "insufficient balance".into(),
            })
        }
        async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn query_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError> {
            unimplemented!()
        }
        async fn list_open_orders(&self, _symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError> {
            Ok(vec![])
        }
        async fn list_order_trades(&self, _symbol: &str, _exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError> {
            Ok(vec![])
        }
        async fn get_listen_key(&self) -> Result<String, ExecError> {
            Ok("key".into())
        }
        async fn keep_alive_listen_key(&self, _key: &str) -> Result<(), ExecError> {
            Ok(())
        }
    }

    async fn created_order(state_machine: &OrderStateMachine) -> Order {
        state_machine
            .create_order(CreateOrderRequest {
                client_order_id: "c1".into(),
                user_id: Uuid::new_v4(),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                time_in_force: TimeInForce::Gtc,
                price: Some(dec!(100)),
                quantity: dec!(1),
                stop_price: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_submission_transitions_to_submitted() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let order = created_order(&state_machine).await;

        submit_to_exchange(
            Arc::new(AcceptingAdapter),
            state_machine.clone(),
            order.order_id,
            AdapterPlaceOrderRequest {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                time_in_force: order.time_in_force,
                quantity: order.quantity,
                price: order.price,
                stop_price: order.stop_price,
                client_order_id: order.client_order_id.clone(),
            },
        )
        .await;

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Submitted);
        assert_eq!(after.exchange_order_id.as_deref(), Some("ex-1"));
    }

    #[tokio::test]
    async fn failed_submission_transitions_to_rejected() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let order = created_order(&state_machine).await;

        submit_to_exchange(
            Arc::new(RejectingAdapter),
            state_machine.clone(),
            order.order_id,
            AdapterPlaceOrderRequest {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                time_in_force: order.time_in_force,
                quantity: order.quantity,
                price: order.price,
                stop_price: order.stop_price,
                client_order_id: order.client_order_id.clone(),
            },
        )
        .await;

        let after = store.get_order(order.order_id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn place_order_blocked_by_kill_switch_creates_no_order() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user_id = Uuid::new_v4();
        store
            .upsert_risk_limits(RiskLimits {
                user_id,
                symbol: "BTCUSDT".into(),
                max_position_size: dec!(10),
                max_exposure: dec!(100000),
                max_daily_loss: dec!(1000),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let risk_validator = Arc::new(RiskValidator::new(store.clone(), 10));
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let facade = AdmissionFacade::with_deps(
            Arc::new(AlwaysBlocked),
            risk_validator,
            state_machine,
            Arc::new(AcceptingAdapter),
            Arc::new(FakeIdempotencyStore::default()),
        );

        let mut req = place_request();
        req.user_id = user_id;
        let result = facade.place_order(req, "key-1").await;

        assert!(matches!(result, Err(ExecError::KillSwitchActive { .. })));
        assert!(store.list_orders_by_user(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn place_order_rejects_when_over_risk_limit() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user_id = Uuid::new_v4();
        store
            .upsert_risk_limits(RiskLimits {
                user_id,
                symbol: "BTCUSDT".into(),
                max_position_size: dec!(1),
                max_exposure: dec!(100000),
                max_daily_loss: dec!(1000),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let risk_validator = Arc::new(RiskValidator::new(store.clone(), 10));
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let facade = AdmissionFacade::with_deps(
            Arc::new(AlwaysOpen),
            risk_validator,
            state_machine,
            Arc::new(AcceptingAdapter),
            Arc::new(FakeIdempotencyStore::default()),
        );

        let mut req = place_request();
        req.user_id = user_id;
        req.quantity = dec!(5);
        let result = facade.place_order(req, "key-1").await;

        assert!(matches!(result, Err(ExecError::RiskLimitExceeded { .. })));
        assert!(store.list_orders_by_user(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn place_order_replays_cached_response_for_same_idempotency_key() {
        let store: Arc<dyn crate::store::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user_id = Uuid::new_v4();
        store
            .upsert_risk_limits(RiskLimits {
                user_id,
                symbol: "BTCUSDT".into(),
                max_position_size: dec!(10),
                max_exposure: dec!(100000),
                max_daily_loss: dec!(1000),
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let risk_validator = Arc::new(RiskValidator::new(store.clone(), 10));
        let state_machine = Arc::new(OrderStateMachine::new(store.clone()));
        let facade = AdmissionFacade::with_deps(
            Arc::new(AlwaysOpen),
            risk_validator,
            state_machine,
            Arc::new(AcceptingAdapter),
            Arc::new(FakeIdempotencyStore::default()),
        );

        let mut req = place_request();
        req.user_id = user_id;
        let first = facade.place_order(req.clone(), "key-1").await.unwrap();
        let second = facade.place_order(req, "key-1").await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(store.list_orders_by_user(user_id).await.unwrap().len(), 1);
    }
}
