//! User-data stream client: listen-key acquisition over REST, a long-lived
//! websocket connection carrying execution reports, periodic pings and
//! listen-key refresh, and exponential-backoff reconnect.
//!
//! The connection lifecycle is an explicit state machine
//! (`Disconnected -> Connecting -> Connected -> Reconnecting`) rather than
//! ad hoc booleans, so `state()` always reflects reality for callers that
//! want to report it. Reconnect delay reuses `utils::backoff::ExponentialBackoff`,
//! the same helper the REST client's retry path uses.

use crate::adapter::rest::RestAdapter;
use crate::error::ExecError;
use crate::utils::{BackoffConfig, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_base_url: String,
    pub ping_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub listen_key_refresh_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_base_url: String::new(),
            ping_interval: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(32),
            connect_timeout: Duration::from_secs(30),
            listen_key_refresh_interval: Duration::from_secs(1800),
        }
    }
}

/// Execution report surfaced to the fill ingestor. Mirrors the subset of
/// the exchange's `executionReport` event this system consumes; any other
/// event type on the stream is dropped before reaching this struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "i")]
    pub exchange_order_id: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "l")]
    pub last_filled_qty: String,
    #[serde(rename = "L")]
    pub last_filled_price: String,
    #[serde(rename = "t")]
    pub trade_id: i64,
    #[serde(rename = "n", default)]
    pub commission: String,
    #[serde(rename = "N", default)]
    pub commission_asset: String,
    #[serde(rename = "m", default)]
    pub is_maker: bool,
    #[serde(rename = "T")]
    pub transaction_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum StreamEvent {
    #[serde(rename = "executionReport")]
    ExecutionReport(ExecutionReport),
    #[serde(other)]
    Other,
}

/// Runs the user-data stream until `shutdown` fires, reconnecting with
/// exponential backoff and re-acquiring a listen key on every fresh
/// connection. Execution reports are forwarded to `tx`; any other channel
/// closure or fatal error ends the loop.
pub struct UserDataStream {
    config: StreamConfig,
    rest: Arc<RestAdapter>,
    state: AtomicU8,
}

impl UserDataStream {
    pub fn new(config: StreamConfig, rest: Arc<RestAdapter>) -> Self {
        Self {
            config,
            rest,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub async fn run(
        &self,
        tx: mpsc::Sender<ExecutionReport>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            initial_delay: self.config.reconnect_base,
            max_delay: self.config.reconnect_max,
            multiplier: 2.0,
            max_retries: None,
            jitter_factor: 0.2,
        });

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_and_serve(&tx, &mut shutdown).await {
                Ok(()) => {
                    info!("user data stream closed cleanly");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "user data stream disconnected, reconnecting");
                    self.set_state(ConnectionState::Reconnecting);
                    let delay = backoff.next_delay().unwrap_or(self.config.reconnect_max);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_serve(
        &self,
        tx: &mpsc::Sender<ExecutionReport>,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ExecError> {
        let listen_key = self.rest.get_listen_key().await?;
        let url = format!("{}/{}", self.config.ws_base_url, listen_key);

        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| ExecError::ExchangeTimeout)?
            .map_err(|e| ExecError::ExchangeApiError {
                code: "WS_CONNECT".to_string(),
                message: e.to_string(),
            })?;

        self.set_state(ConnectionState::Connected);
        info!("user data stream connected");

        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        let mut key_refresh_deadline = Instant::now() + self.config.listen_key_refresh_interval;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Err(ExecError::StreamDisconnected);
                    }
                }
                _ = tokio::time::sleep_until(key_refresh_deadline) => {
                    if let Err(err) = self.rest.keep_alive_listen_key(&listen_key).await {
                        warn!(error = %err, "listen key refresh failed");
                    }
                    key_refresh_deadline = Instant::now() + self.config.listen_key_refresh_interval;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, tx).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Err(ExecError::StreamDisconnected),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "websocket read error");
                            return Err(ExecError::StreamDisconnected);
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, tx: &mpsc::Sender<ExecutionReport>) {
        match serde_json::from_str::<StreamEvent>(text) {
            Ok(StreamEvent::ExecutionReport(report)) => {
                if tx.send(report).await.is_err() {
                    debug!("execution report receiver dropped");
                }
            }
            Ok(StreamEvent::Other) => {}
            Err(err) => warn!(error = %err, "failed to parse stream frame"),
        }
    }
}
