//! Fire-and-forget writes
//!
//! Progress snapshots and ledger mirrors must never fail a run. Calling
//! [`BestEffort::or_log`] on their result logs the error at warn level and
//! drops it, so every such call site is easy to find.

use std::fmt::Display;

pub trait BestEffort<T> {
    /// `Some(value)` on success; on error, log `what` with the error and return `None`.
    fn or_log(self, what: &str) -> Option<T>;
}

impl<T, E: Display> BestEffort<T> for Result<T, E> {
    fn or_log(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{what} failed (ignored)");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_log() {
        let ok: Result<u32, String> = Ok(7);
        assert_eq!(ok.or_log("write"), Some(7));

        let err: Result<u32, String> = Err("connection reset".to_string());
        assert_eq!(err.or_log("write"), None);
    }
}
