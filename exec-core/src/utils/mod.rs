pub mod backoff;
pub mod logger;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use logger::init_logger;
