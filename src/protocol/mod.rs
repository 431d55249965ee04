pub mod errors;
pub mod messages;
pub mod types;

pub use errors::{disconnect_reason, ack_reason, is_retryable_reason, RETRYABLE_REASONS};
pub use messages::{BusMessage, Validate};
pub use types::*;
