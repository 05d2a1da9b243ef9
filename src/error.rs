//! Error taxonomy shared by every registry and engine operation
use sled::transaction::TransactionError;

/// Coarse classification of a [`MarketError`], useful when the caller only
/// needs to decide between "fix your request" and "try again later".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidState,
    InvalidArgument,
    ExternalFailure,
    Storage,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("external failure: {0}")]
    ExternalFailure(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::NotFound(_) => ErrorKind::NotFound,
            MarketError::Forbidden(_) => ErrorKind::Forbidden,
            MarketError::InvalidState(_) => ErrorKind::InvalidState,
            MarketError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MarketError::ExternalFailure(_) => ErrorKind::ExternalFailure,
            MarketError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Deterministic errors are caller-fixable and must not be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ExternalFailure | ErrorKind::Storage)
    }

    pub(crate) fn not_found(what: &str, id: &str) -> Self {
        MarketError::NotFound(format!("{what} '{id}'"))
    }
}

impl From<sled::Error> for MarketError {
    fn from(value: sled::Error) -> Self {
        MarketError::Storage(value.to_string())
    }
}

impl From<minicbor::decode::Error> for MarketError {
    fn from(value: minicbor::decode::Error) -> Self {
        MarketError::Storage(format!("failed to decode record: {value}"))
    }
}

impl From<TransactionError<MarketError>> for MarketError {
    fn from(value: TransactionError<MarketError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => MarketError::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_abort_passes_payload_through() {
        let err: MarketError =
            TransactionError::Abort(MarketError::InvalidState("sold".into())).into();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!err.is_retryable());
    }

    #[test]
    fn external_failures_are_retryable() {
        assert!(MarketError::ExternalFailure("timeout".into()).is_retryable());
        assert!(!MarketError::Forbidden("nope".into()).is_retryable());
    }
}
