pub mod error_recovery;

pub use error_recovery::{BackoffPolicy, CircuitBreaker, CircuitState};
