//! Pre-trade risk validation: per-(user, symbol) limit lookup plus a
//! short-TTL approval cache.

pub mod validator;

pub use validator::{ApprovalRequest, RiskValidator};
