use derive_more::Display;
use thiserror::Error;

/// All errors generated in `market-sync`.
///
/// Each component classifies its own failures into one of these variants at its boundary.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SyncError {
    #[error("all history providers unavailable: {}", display_failures(.failures))]
    ProviderUnavailable { failures: Vec<ProviderFailure> },

    #[error("symbol {symbol} invalid: {reason}")]
    SymbolInvalid { symbol: String, reason: String },

    #[error("stream connection lost (close code {code}): {reason}")]
    ConnectionLost { code: u16, reason: String },

    #[error("stream reconnection abandoned after {attempts} attempts")]
    MaxReconnectExceeded { attempts: u32 },

    #[error("candle series invariant violated by {operation}")]
    InvariantViolation { operation: &'static str },

    #[error("coordinator stopped")]
    Stopped,
}

impl SyncError {
    /// Determine if an error is a standing condition that automatic retries will not clear.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            SyncError::SymbolInvalid { .. } => true,
            SyncError::MaxReconnectExceeded { .. } => true,
            SyncError::Stopped => true,
            _ => false,
        }
    }

    /// Determine if an error is expected to heal through fallback or reconnection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ProviderUnavailable { .. } | SyncError::ConnectionLost { .. }
        )
    }
}

fn display_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }

    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How a single history provider failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum FailureKind {
    /// Network error, timeout, 5xx, rate limit or malformed body.
    Unavailable,
    /// The provider does not recognise the symbol (4xx).
    SymbolInvalid,
}

/// Failure reason recorded for one provider in the fallback chain.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{provider} {kind}: {reason}")]
pub struct ProviderFailure {
    pub provider: &'static str,
    pub kind: FailureKind,
    pub reason: String,
}

/// Error returned by a single [`HistoryProvider`](crate::history::HistoryProvider) call.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{kind}: {reason}")]
pub struct ProviderError {
    pub kind: FailureKind,
    pub reason: String,
}

impl ProviderError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unavailable,
            reason: reason.into(),
        }
    }

    pub fn symbol_invalid(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::SymbolInvalid,
            reason: reason.into(),
        }
    }

    pub fn malformed(error: impl std::fmt::Display) -> Self {
        Self::unavailable(format!("malformed response: {error}"))
    }

    pub fn into_failure(self, provider: &'static str) -> ProviderFailure {
        ProviderFailure {
            provider,
            kind: self.kind,
            reason: self.reason,
        }
    }
}
