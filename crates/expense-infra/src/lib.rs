//! Expense Pipeline Infrastructure
//!
//! Cross-cutting pieces used by the workers: the retry/backoff policy, the
//! retrying HTTP attachment fetcher and tracing initialization.

pub mod download;
pub mod retry;
pub mod telemetry;

pub use download::{FetchError, FetchedFile, Fetcher, HttpFetcher};
pub use retry::{retry_async, RetryExhausted, RetryStrategy};
pub use telemetry::{init_telemetry, shutdown_telemetry};
