//! Worker protocol client.
//!
//! A session is a sequence of commands executed on one worker. The
//! [`WorkerClient`] trait is the seam between the dispatch controller and
//! the wire; [`HttpWorkerClient`] speaks the JSON-over-HTTP protocol the
//! workers expose on their command endpoint.

use std::future::Future;
use std::pin::Pin;

use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One step of a session's command sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub name: String,
    /// Protocol-specific arguments, opaque to the dispatcher.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Result of one command, as reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Result of a whole session attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionResult {
    pub outcomes: Vec<CommandOutcome>,
}

impl SessionResult {
    /// True when every command in the session succeeded.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }
}

/// Errors surfaced by a worker client. Both kinds abort the current
/// attempt; the controller decides whether to rebind and retry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The worker could not be reached or the connection broke mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker answered but reported a protocol-level fault.
    #[error("worker fault: {0}")]
    Worker(String),
}

/// Executes a command sequence against one worker's command endpoint.
pub trait WorkerClient: Send + Sync {
    fn execute(
        &self,
        address: &str,
        commands: &[Command],
    ) -> BoxFuture<Result<SessionResult, ClientError>>;
}

/// JSON-over-HTTP worker client. Posts the command sequence to the
/// worker's `/session` endpoint and parses the reported outcomes.
#[derive(Debug, Default)]
pub struct HttpWorkerClient;

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerClient for HttpWorkerClient {
    fn execute(
        &self,
        address: &str,
        commands: &[Command],
    ) -> BoxFuture<Result<SessionResult, ClientError>> {
        let address = address.to_string();
        let body = serde_json::to_vec(commands);

        Box::pin(async move {
            let body = body.map_err(|e| ClientError::Transport(e.to_string()))?;
            let uri = format!("http://{address}/session");

            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("POST")
                .uri(&uri)
                .header("host", &address)
                .header("content-type", "application/json")
                .header("user-agent", "gridhub-dispatch/0.1")
                .body(http_body_util::Full::new(bytes::Bytes::from(body)))
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let status = resp.status();
            debug!(%uri, %status, "session response");
            if !status.is_success() {
                return Err(ClientError::Worker(format!("status {status}")));
            }

            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?
                .to_bytes();

            serde_json::from_slice(&bytes).map_err(|e| ClientError::Worker(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_result_passes_only_when_all_succeed() {
        let mut result = SessionResult {
            outcomes: vec![
                CommandOutcome {
                    name: "navigate".to_string(),
                    success: true,
                    detail: None,
                },
                CommandOutcome {
                    name: "click".to_string(),
                    success: true,
                    detail: None,
                },
            ],
        };
        assert!(result.passed());

        result.outcomes[1].success = false;
        assert!(!result.passed());
    }

    #[test]
    fn empty_session_result_passes() {
        assert!(SessionResult::default().passed());
    }

    #[test]
    fn command_payload_defaults_to_null_on_decode() {
        let cmd: Command = serde_json::from_str(r#"{"name":"navigate"}"#).unwrap();
        assert_eq!(cmd, Command::new("navigate"));
    }

    #[tokio::test]
    async fn execute_against_closed_port_is_transport_error() {
        let client = HttpWorkerClient::new();
        let result = client.execute("127.0.0.1:1", &[Command::new("noop")]).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
