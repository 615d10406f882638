pub mod error;
pub mod retry;
pub mod time;

pub use error::{MirrorError, MirrorResult};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy, Retryable};
pub use time::Timestamp;
