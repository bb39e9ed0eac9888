// =============================================================================
// Exchange error taxonomy
// =============================================================================

use thiserror::Error;

/// Classified exchange-facing error. Gateway methods return
/// `Result<T, ExchangeError>` rather than `anyhow::Result<T>` so callers can
/// match and branch; everything above the gateway boundary wraps this in
/// `anyhow::Error` via `.context(...)`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited,

    #[error("position mode mismatch")]
    PositionModeMismatch,

    #[error("reduce-only leverage conflict")]
    ReduceOnlyLeverageConflict,

    #[error("no position to close")]
    NoPositionToClose,

    #[error("quantity/notional violation: requested {requested}, cap {cap}")]
    QuantityViolation { requested: f64, cap: f64 },

    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

impl ExchangeError {
    /// Whether the caller should retry this class of error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_) | ExchangeError::RateLimited | ExchangeError::PositionModeMismatch
        )
    }

    /// Classify a raw exchange error code + message into an `ExchangeError`.
    /// Grounded in the gateway's error-taxonomy table: known numeric codes and
    /// message substrings map to specific variants; anything unrecognized is
    /// treated as fatal so it surfaces rather than retries silently forever.
    pub fn classify(code: Option<i64>, message: &str) -> Self {
        let lower = message.to_lowercase();

        match code {
            Some(330011) => return ExchangeError::PositionModeMismatch,
            Some(330008) => return ExchangeError::ReduceOnlyLeverageConflict,
            Some(300009) => return ExchangeError::NoPositionToClose,
            Some(100001) => {
                return ExchangeError::QuantityViolation { requested: 0.0, cap: 0.0 };
            }
            _ => {}
        }

        if lower.contains("no open position") || lower.contains("no position to close") {
            ExchangeError::NoPositionToClose
        } else if lower.contains("rate limit") {
            ExchangeError::RateLimited
        } else if lower.contains("position mode") {
            ExchangeError::PositionModeMismatch
        } else if lower.contains("timeout") || lower.contains("connection") || is_5xx(code) {
            ExchangeError::Transient(message.to_string())
        } else if lower.contains("signature") || lower.contains("permission") || lower.contains("invalid api") {
            ExchangeError::Fatal(message.to_string())
        } else {
            ExchangeError::Transient(message.to_string())
        }
    }
}

fn is_5xx(code: Option<i64>) -> bool {
    matches!(code, Some(c) if (500..600).contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        assert_eq!(ExchangeError::classify(Some(330011), "x"), ExchangeError::PositionModeMismatch);
        assert_eq!(ExchangeError::classify(Some(330008), "x"), ExchangeError::ReduceOnlyLeverageConflict);
        assert_eq!(ExchangeError::classify(Some(300009), "x"), ExchangeError::NoPositionToClose);
    }

    #[test]
    fn classifies_message_substrings() {
        assert_eq!(
            ExchangeError::classify(None, "No open positions to close"),
            ExchangeError::NoPositionToClose
        );
        assert!(matches!(
            ExchangeError::classify(None, "Invalid signature"),
            ExchangeError::Fatal(_)
        ));
    }

    #[test]
    fn fatal_is_not_retryable() {
        assert!(!ExchangeError::Fatal("bad creds".into()).is_retryable());
        assert!(ExchangeError::Transient("timeout".into()).is_retryable());
    }
}
