//! Error types for the Ebb clients.
use serde_json::Value;
use thiserror::Error;

use crate::types::Tip;

/// Error returned by a consumer's chain-sync handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection is not open")] ConnectionNotOpen,
    #[error("intersection not found; remote tip is {tip}")] IntersectionNotFound { tip: Tip },
    #[error("unknown instruction: {0}")] UnknownInstruction(String),
    #[error("protocol error: {0}")] Protocol(String),
    #[error("chain sync already started on this client")] AlreadySyncing,
    #[error("invalid in-flight window: {0}")] InvalidWindow(usize),
    #[error("fault from remote ({code}): {message}")] Fault { code: String, message: String },
    #[error("request timed out")] Timeout,
    #[error("transaction rejected: {0:?}")] SubmitFailed(Vec<Value>),
    #[error("handler panicked: {0}")] HandlerPanicked(String),
    #[error("transport: {0}")] Transport(String),
    #[error("config: {0}")] Config(String),
    #[error(transparent)] Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_display_carries_code() {
        let err = ClientError::Fault {
            code: "client".into(),
            message: "unknown method".into(),
        };
        assert_eq!(err.to_string(), "fault from remote (client): unknown method");
    }

    #[test]
    fn handler_panic_carries_payload() {
        let err = ClientError::HandlerPanicked("slot 7 out of range".into());
        assert_eq!(err.to_string(), "handler panicked: slot 7 out of range");
    }

    #[test]
    fn intersection_not_found_mentions_tip() {
        let err = ClientError::IntersectionNotFound { tip: Tip::Origin };
        assert_eq!(err.to_string(), "intersection not found; remote tip is origin");
    }
}
