pub mod correlation;
pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use correlation::{CorrelationId, CorrelationIdLayer, X_CORRELATION_ID, X_REQUEST_ID};
pub use logging::{init_structured_logging, init_with_service, LogConfig, LogFormat};
