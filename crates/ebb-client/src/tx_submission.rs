//! Transaction submission over the shared connection.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use ebb_core::ClientError;
use ebb_core::constants::methods;

use crate::connection::{Connection, InteractionContext, close_and_wait};
use crate::query::{QueryClient, QueryOptions};

#[derive(Debug)]
pub struct TxSubmissionClient {
    query: QueryClient,
}

impl TxSubmissionClient {
    /// Must be called from within a Tokio runtime.
    pub fn new(connection: Arc<dyn Connection>, options: QueryOptions) -> Self {
        Self {
            query: QueryClient::new(connection, options),
        }
    }

    pub fn from_context(context: &InteractionContext) -> Self {
        Self::new(Arc::clone(&context.connection), QueryOptions::from_config(&context.config))
    }

    /// Submit a hex-encoded serialized transaction.
    pub async fn submit_tx(&self, tx_hex: &str) -> Result<(), ClientError> {
        let response = self
            .query
            .request(methods::SUBMIT_TX, Some(json!({ "submit": tx_hex })))
            .await?;
        match response.into_result()? {
            Value::String(s) if s == "SubmitSuccess" => {
                info!(bytes = tx_hex.len() / 2, "transaction accepted");
                Ok(())
            }
            Value::Object(mut map) if map.contains_key("SubmitFail") => {
                let errors = match map.remove("SubmitFail") {
                    Some(Value::Array(errors)) => errors,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                warn!(errors = errors.len(), "transaction rejected");
                Err(ClientError::SubmitFailed(errors))
            }
            other => Err(ClientError::Protocol(format!("unexpected SubmitTx result: {other}"))),
        }
    }

    /// Close the shared connection and wait for the acknowledgment.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        close_and_wait(self.query.connection().as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use ebb_core::Response;

    fn node(result: Value) -> Arc<MemoryConnection> {
        MemoryConnection::with_responder(move |request| {
            vec![Response::success(&request.methodname, result.clone()).with_reflection(request.mirror.clone())]
        })
    }

    #[tokio::test]
    async fn accepted_submission() {
        let conn = node(json!("SubmitSuccess"));
        let client = TxSubmissionClient::new(conn.clone(), QueryOptions::default());
        client.submit_tx("84a300").await.unwrap();
        assert_eq!(conn.sent_requests()[0].args, Some(json!({ "submit": "84a300" })));
    }

    #[tokio::test]
    async fn rejected_submission_carries_errors() {
        let conn = node(json!({ "SubmitFail": [{ "badInputs": [] }, { "feeTooSmall": 1 }] }));
        let client = TxSubmissionClient::new(conn, QueryOptions::default());
        match client.submit_tx("00").await {
            Err(ClientError::SubmitFailed(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_closes_connection() {
        let conn = node(json!("SubmitSuccess"));
        let client = TxSubmissionClient::new(conn.clone(), QueryOptions::default());
        client.shutdown().await.unwrap();
        assert!(!conn.is_open());
        assert!(matches!(client.shutdown().await, Err(ClientError::ConnectionNotOpen)));
    }
}
