//! Cluster-visible kill switch, backed by a single logical Redis key
//! (`kill_switch:global`) holding JSON `{active, reason, activated_at,
//! activated_by}`. Absence of the key means inactive.
//!
//! This replaces the single-process, signal-driven design (`Arc<AtomicU8>`
//! plus `SIGTERM`/`SIGUSR1` handlers) a standalone HFT process can get away
//! with: that design cannot satisfy "all processes see the same view",
//! which a multi-process execution core requires. Writes are last-writer-
//! wins and are NOT atomic with any database transaction. This is an
//! advisory admission gate, not a transactional boundary; reconciliation
//! is the backstop for the accept-then-activate race.

use crate::domain::KillSwitchState;
use crate::error::ExecError;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{info, warn};

const KEY: &str = "kill_switch:global";

/// Admission-time gate, implemented by [`KillSwitchRegistry`] against the
/// real cluster-visible Redis key. Lets `AdmissionFacade` be driven in
/// tests without a live Redis, the same way `Store` already does for the
/// durable order state.
#[async_trait]
pub trait KillSwitchGate: Send + Sync {
    async fn check_or_fail(&self) -> Result<(), ExecError>;
}

pub struct KillSwitchRegistry {
    client: redis::Client,
}

impl KillSwitchRegistry {
    pub fn new(redis_url: &str) -> Result<Self, ExecError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, ExecError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))
    }

    pub async fn get(&self) -> Result<KillSwitchState, ExecError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(KEY)
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        match raw {
            None => Ok(KillSwitchState::clear()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| ExecError::KillSwitchRegistry(format!("corrupt kill switch state: {e}"))),
        }
    }

    pub async fn activate(&self, reason: &str, actor: &str) -> Result<(), ExecError> {
        let state = KillSwitchState {
            active: true,
            reason: Some(reason.to_string()),
            activated_at: Some(Utc::now()),
            activated_by: Some(actor.to_string()),
        };
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(&state)
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        conn.set::<_, _, ()>(KEY, json)
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        warn!(reason, actor, "kill switch activated");
        Ok(())
    }

    pub async fn deactivate(&self) -> Result<(), ExecError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(KEY)
            .await
            .map_err(|e| ExecError::KillSwitchRegistry(e.to_string()))?;
        info!("kill switch deactivated");
        Ok(())
    }

    /// Used by the Admission Façade as the first check on every order.
    pub async fn check_or_fail(&self) -> Result<(), ExecError> {
        let state = self.get().await?;
        if state.active {
            return Err(ExecError::KillSwitchActive {
                reason: state.reason.unwrap_or_default(),
                activated_at: state.activated_at.unwrap_or_else(Utc::now),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KillSwitchGate for KillSwitchRegistry {
    async fn check_or_fail(&self) -> Result<(), ExecError> {
        KillSwitchRegistry::check_or_fail(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_state_is_inactive() {
        let state = KillSwitchState::clear();
        assert!(!state.active);
        assert!(state.reason.is_none());
    }
}
