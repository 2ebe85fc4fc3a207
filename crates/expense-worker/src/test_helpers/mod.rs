//! Test helpers for worker tests
//!
//! In-memory doubles for every store and port plus row fixtures, so workers
//! can be exercised end to end without a database or network.

pub mod fixtures;
pub mod mock_ports;
pub mod mock_storage;
pub mod mock_stores;

pub use fixtures::*;
pub use mock_ports::*;
pub use mock_storage::*;
pub use mock_stores::*;
