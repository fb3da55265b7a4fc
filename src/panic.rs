//! Panics caught while a periodic worker runs a pass.
//!
//! [`run_periodic`](crate::worker::run_periodic) isolates every pass with
//! `catch_unwind`. The payload it gets back is wrapped in a [`WorkerPanic`]
//! so the log line and the panic counter name the worker that failed.

use std::{any::Any, fmt};

/// A panic payload tagged with the worker whose pass raised it.
///
/// String payloads (the usual `panic!("...")` forms) are shown verbatim;
/// anything else is shown through `Debug`.
///
/// ```
/// use msh_reliability::panic::WorkerPanic;
///
/// let caught = std::panic::catch_unwind(|| panic!("claim batch corrupt")).unwrap_err();
/// let panic = WorkerPanic::new("retry-scheduler", caught);
/// assert_eq!(panic.worker(), "retry-scheduler");
/// assert_eq!(panic.message(), "claim batch corrupt");
/// assert_eq!(panic.to_string(), "retry-scheduler pass panicked: claim batch corrupt");
/// ```
#[derive(Debug)]
#[must_use]
pub struct WorkerPanic {
    worker: &'static str,
    payload: Box<dyn Any + Send>,
}

impl WorkerPanic {
    /// Tag `payload` with the worker that caught it.
    pub fn new(worker: &'static str, payload: Box<dyn Any + Send>) -> Self {
        Self { worker, payload }
    }

    /// Name of the worker whose pass panicked.
    #[must_use]
    pub fn worker(&self) -> &'static str { self.worker }

    /// The panic message, or the payload's `Debug` form when it is not a
    /// string.
    #[must_use]
    pub fn message(&self) -> String {
        if let Some(s) = self.payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else {
            format!("{:?}", self.payload)
        }
    }
}

impl fmt::Display for WorkerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pass panicked: {}", self.worker, self.message())
    }
}
