//! Explicit "ignore and continue" for steps whose failure must not abort the
//! surrounding operation (teardown of resources that may already be gone).

use std::fmt::Display;
use tracing::warn;

pub trait BestEffort<T> {
    /// Log a failure as a warning tagged with `step` and continue.
    fn best_effort(self, step: &str) -> Option<T>;
}

impl<T, E: Display> BestEffort<T> for std::result::Result<T, E> {
    fn best_effort(self, step: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step, error = %e, "best-effort step failed, continuing");
                None
            }
        }
    }
}
