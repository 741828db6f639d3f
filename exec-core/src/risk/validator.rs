use crate::domain::{RiskLimits, Side};
use crate::error::{ExecError, ViolationType};
use crate::store::Store;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub current_position: Decimal,
    pub position_version: i64,
}

#[derive(Debug, Clone)]
pub struct Approval {
    pub limits: RiskLimits,
    pub validated_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CachedApproval {
    approval: Approval,
    expires_at: DateTime<Utc>,
}

/// Validates order admission against per-(user, symbol) limits, with an
/// in-process short-TTL approval cache keyed by position version so any
/// position mutation automatically invalidates prior approvals. Rejections
/// are never cached.
pub struct RiskValidator {
    store: Arc<dyn Store>,
    cache: DashMap<String, CachedApproval>,
    ttl: Duration,
}

impl RiskValidator {
    pub fn new(store: Arc<dyn Store>, ttl_sec: u64) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl: Duration::from_secs(ttl_sec),
        }
    }

    fn cache_key(req: &ApprovalRequest) -> String {
        format!(
            "risk:approval:{}:{}:{:?}:{}:{}",
            req.user_id, req.symbol, req.side, req.quantity, req.position_version
        )
    }

    pub async fn validate(&self, req: ApprovalRequest) -> Result<Approval, ExecError> {
        let key = Self::cache_key(&req);
        let now = Utc::now();

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > now {
                return Ok(cached.approval.clone());
            }
        }

        let position = self.store.get_or_create_position(req.user_id, &req.symbol, now).await?;
        if position.version != req.position_version {
            return Err(ExecError::PositionChanged {
                expected: req.position_version,
                found: position.version,
            });
        }

        let limits = self
            .store
            .get_risk_limits(req.user_id, &req.symbol)
            .await?
            .ok_or(ExecError::NoLimitsConfigured {
                user_id: req.user_id,
                symbol: req.symbol.clone(),
            })?;

        let signed_delta = req.side.sign() * req.quantity;
        let projected = req.current_position + signed_delta;

        if projected.abs() > limits.max_position_size {
            return Err(ExecError::RiskLimitExceeded {
                violation_type: ViolationType::MaxPositionSize,
            });
        }

        let approval = Approval {
            limits,
            validated_at: now,
        };
        self.cache.insert(
            key,
            CachedApproval {
                approval: approval.clone(),
                expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            },
        );

        Ok(approval)
    }

    /// Admin-triggered purge of the whole approval cache (`risk:approval:*`).
    pub fn clear_approval_cache(&self) {
        self.cache.clear();
    }
}
