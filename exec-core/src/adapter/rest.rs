//! Signed REST client for the exchange's order-management API.
//!
//! Built on `reqwest` plus `hmac`/`sha2`/`hex` for request signing. Every
//! call goes `rate_limiter.acquire -> circuit_breaker.call -> request`.

use super::{
    CircuitBreaker, CircuitBreakerConfig, ExchangeAdapter, ExchangeOrderStatus, ExchangeTrade, PlaceOrderRequest,
    PlaceOrderResponse, RateLimiter, RateLimiterConfig,
};
use crate::domain::OrderType;
use crate::error::ExecError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

fn order_type_wire(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::TakeProfit => "TAKE_PROFIT",
    }
}

pub struct RestAdapterConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub call_timeout: Duration,
}

pub struct RestAdapter {
    config: RestAdapterConfig,
    http: reqwest::Client,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
}

impl RestAdapter {
    pub fn new(config: RestAdapterConfig, rate_limiter_config: RateLimiterConfig, circuit_breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            rate_limiter: RateLimiter::new(rate_limiter_config),
            circuit_breaker: CircuitBreaker::new(circuit_breaker_config),
            config,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".to_string(), Self::timestamp_ms().to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn execute_json<T: serde::de::DeserializeOwned>(&self, method: reqwest::Method, path: &str, query: String) -> Result<T, ExecError> {
        self.rate_limiter.acquire().await?;
        let url = format!("{}{path}?{query}", self.config.base_url);
        let http = &self.http;
        let api_key = self.config.api_key.clone();
        let timeout = self.config.call_timeout;

        self.circuit_breaker
            .call(|| async move {
                let response = tokio::time::timeout(
                    timeout,
                    http.request(method, &url)
                        .header("X-API-KEY", api_key)
                        .send(),
                )
                .await
                .map_err(|_| ExecError::ExchangeTimeout)?
                .map_err(|e| ExecError::ExchangeApiError {
                    code: "NETWORK".to_string(),
                    message: e.to_string(),
                })?;

                if response.status().is_server_error() {
                    return Err(ExecError::ExchangeApiError {
                        code: response.status().to_string(),
                        message: "server error".to_string(),
                    });
                }
                if !response.status().is_success() {
                    let status = response.status().to_string();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ExecError::ExchangeApiError {
                        code: status,
                        message: body,
                    });
                }

                response
                    .json::<T>()
                    .await
                    .map_err(|e| ExecError::ExchangeApiError {
                        code: "DECODE".to_string(),
                        message: e.to_string(),
                    })
            })
            .await
    }
}

#[derive(serde::Deserialize)]
struct PlaceOrderRaw {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(serde::Deserialize)]
struct QueryOrderRaw {
    #[serde(rename = "orderId")]
    order_id: String,
    status: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(serde::Deserialize)]
struct ListenKeyRaw {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[async_trait]
impl ExchangeAdapter for RestAdapter {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResponse, ExecError> {
        let mut params = vec![
            ("symbol".to_string(), req.symbol),
            ("side".to_string(), format!("{:?}", req.side).to_uppercase()),
            ("type".to_string(), order_type_wire(req.order_type).to_string()),
            ("quantity".to_string(), req.quantity.to_string()),
            ("newClientOrderId".to_string(), req.client_order_id),
        ];
        if let Some(price) = req.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(stop_price) = req.stop_price {
            params.push(("stopPrice".to_string(), stop_price.to_string()));
        }
        let query = self.signed_query(params);
        let raw: PlaceOrderRaw = self.execute_json(reqwest::Method::POST, "/api/v3/order", query).await?;
        Ok(PlaceOrderResponse {
            exchange_order_id: raw.order_id,
        })
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), ExecError> {
        let query = self.signed_query(vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), exchange_order_id.to_string()),
        ]);
        let _: serde_json::Value = self.execute_json(reqwest::Method::DELETE, "/api/v3/order", query).await?;
        Ok(())
    }

    async fn query_order(&self, symbol: &str, exchange_order_id: &str) -> Result<ExchangeOrderStatus, ExecError> {
        let query = self.signed_query(vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), exchange_order_id.to_string()),
        ]);
        let raw: QueryOrderRaw = self.execute_json(reqwest::Method::GET, "/api/v3/order", query).await?;
        Ok(ExchangeOrderStatus {
            exchange_order_id: raw.order_id,
            status: raw.status,
            filled_qty: raw.executed_qty.parse().unwrap_or_default(),
            avg_price: raw.avg_price.parse().unwrap_or_default(),
        })
    }

    async fn list_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrderStatus>, ExecError> {
        let mut params = vec![];
        if let Some(symbol) = symbol {
            params.push(("symbol".to_string(), symbol.to_string()));
        }
        let query = self.signed_query(params);
        let raws: Vec<QueryOrderRaw> = self.execute_json(reqwest::Method::GET, "/api/v3/openOrders", query).await?;
        Ok(raws
            .into_iter()
            .map(|raw| ExchangeOrderStatus {
                exchange_order_id: raw.order_id,
                status: raw.status,
                filled_qty: raw.executed_qty.parse().unwrap_or_default(),
                avg_price: raw.avg_price.parse().unwrap_or_default(),
            })
            .collect())
    }

    async fn list_order_trades(&self, symbol: &str, exchange_order_id: &str) -> Result<Vec<ExchangeTrade>, ExecError> {
        let query = self.signed_query(vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), exchange_order_id.to_string()),
        ]);
        #[derive(serde::Deserialize)]
        struct TradeRaw {
            id: String,
            #[serde(rename = "orderId")]
            order_id: String,
            price: String,
            qty: String,
            commission: String,
            #[serde(rename = "commissionAsset")]
            commission_asset: String,
            time: i64,
        }
        let raws: Vec<TradeRaw> = self.execute_json(reqwest::Method::GET, "/api/v3/myTrades", query).await?;
        Ok(raws
            .into_iter()
            .map(|raw| ExchangeTrade {
                exchange_trade_id: raw.id,
                exchange_order_id: raw.order_id,
                price: raw.price.parse().unwrap_or_default(),
                quantity: raw.qty.parse().unwrap_or_default(),
                fee: raw.commission.parse().unwrap_or_default(),
                fee_asset: raw.commission_asset,
                traded_at: chrono::DateTime::from_timestamp_millis(raw.time).unwrap_or_else(chrono::Utc::now),
            })
            .collect())
    }

    async fn get_listen_key(&self) -> Result<String, ExecError> {
        let raw: ListenKeyRaw = self
            .execute_json(reqwest::Method::POST, "/api/v3/userDataStream", String::new())
            .await?;
        Ok(raw.listen_key)
    }

    async fn keep_alive_listen_key(&self, key: &str) -> Result<(), ExecError> {
        let query = format!("listenKey={key}");
        let _: serde_json::Value = self.execute_json(reqwest::Method::PUT, "/api/v3/userDataStream", query).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_same_input() {
        let adapter = RestAdapter::new(
            RestAdapterConfig {
                base_url: "https://example.com".into(),
                api_key: "key".into(),
                api_secret: "secret".into(),
                call_timeout: Duration::from_secs(10),
            },
            RateLimiterConfig::default(),
            CircuitBreakerConfig::default(),
        );
        let sig1 = adapter.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = adapter.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_ne!(sig1, adapter.sign("symbol=ETHUSDT&timestamp=1"));
    }
}
