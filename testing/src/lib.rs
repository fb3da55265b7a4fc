//! Test doubles and fixtures for `msh_reliability`.
//!
//! The helpers wrap the in-memory store with fault injection, record every
//! status event and dispatch request, and build fully wired cores for
//! integration tests.
//!
//! ```rust
//! use msh_reliability::CoreConfig;
//! use msh_testing::{Gateway, TestResult};
//!
//! fn example() -> TestResult {
//!     let gateway = Gateway::new(CoreConfig::default())?;
//!     assert!(gateway.sink.events().is_empty());
//!     Ok(())
//! }
//! ```

pub mod flaky;
pub mod harness;
pub mod logging;
pub mod payload;
pub mod recording;

pub use flaky::{FaultPlan, FlakyStore};
pub use harness::{Gateway, SequentialGroupIds, gateway, t0};
pub use logging::{LoggerHandle, logger};
pub use payload::patterned;
pub use recording::{RecordingDispatcher, RecordingSink};

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
