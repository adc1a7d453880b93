//! Tools exposed to backends
//!
//! Backends that support tool use receive a [`ToolSet`] with each request.
//! The broker core never inspects tool semantics; the only built-in tool
//! round-trips a command through the job's own connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::RequestBroker;
use crate::job::{ConnectionId, JobId};
use crate::session::AckOutcome;

/// Name of the connection command tool
pub const RUN_COMMAND_TOOL: &str = "run_command";

/// Schema advertised to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// What the tool does, as shown to the model
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: serde_json::Value,
}

/// A call requested by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arguments object
    pub arguments: serde_json::Value,
}

/// Tools available to one backend run
#[async_trait]
pub trait ToolSet: Send + Sync {
    /// Definitions to advertise
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run a call and return its textual result. Failures are reported in
    /// the text so the backend can react to them.
    async fn invoke(&self, call: &ToolCall) -> String;
}

/// Empty tool set
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolSet for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn invoke(&self, call: &ToolCall) -> String {
        format!("unknown tool: {}", call.name)
    }
}

/// `run_command` bound to one job's connection
pub struct ConnectionTools {
    broker: Arc<RequestBroker>,
    connection_id: ConnectionId,
    job_id: JobId,
    timeout: Duration,
}

impl ConnectionTools {
    /// Bind the tool set to a job
    #[must_use]
    pub fn new(
        broker: Arc<RequestBroker>,
        connection_id: ConnectionId,
        job_id: JobId,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            connection_id,
            job_id,
            timeout,
        }
    }

    fn describe(outcome: &AckOutcome) -> String {
        match outcome {
            AckOutcome::Success(message) if message.is_empty() => "command succeeded".to_string(),
            AckOutcome::Success(message) => format!("command succeeded: {message}"),
            AckOutcome::Failure(message) => format!("command failed: {message}"),
            AckOutcome::ConnectionClosed => "command failed: connection closed".to_string(),
            AckOutcome::TimedOut => "command failed: no acknowledgement in time".to_string(),
        }
    }
}

#[async_trait]
impl ToolSet for ConnectionTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: RUN_COMMAND_TOOL.to_string(),
            description: "Run a command on the user's side of the connection and report the result"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command line to run"
                    }
                },
                "required": ["command"]
            }),
        }]
    }

    async fn invoke(&self, call: &ToolCall) -> String {
        if call.name != RUN_COMMAND_TOOL {
            return format!("unknown tool: {}", call.name);
        }
        let Some(command) = call.arguments.get("command").and_then(|c| c.as_str()) else {
            return "command failed: missing 'command' argument".to_string();
        };

        let outcome = self
            .broker
            .request_action(self.connection_id, self.job_id, command, self.timeout)
            .await
            .unwrap_or(AckOutcome::ConnectionClosed);

        tracing::debug!(
            job_id = %self.job_id,
            connection_id = %self.connection_id,
            success = outcome.is_success(),
            "Tool call finished"
        );
        Self::describe(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EgressMessage;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_run_command_round_trip() {
        let broker = Arc::new(RequestBroker::default());
        let conn = ConnectionId::new();
        let mut queue = broker.register_session(conn);
        let tools = ConnectionTools::new(broker.clone(), conn, JobId::new(), Duration::from_secs(5));

        let acker = tokio::spawn(async move {
            if let Some(EgressMessage::Action(request)) = queue.receiver.recv().await {
                queue
                    .pending
                    .resolve(&request.correlation_id, AckOutcome::Success("gave 1 diamond".into()));
            }
        });

        let result = tools
            .invoke(&call(RUN_COMMAND_TOOL, serde_json::json!({"command": "/give @p diamond"})))
            .await;
        acker.await.unwrap();
        assert_eq!(result, "command succeeded: gave 1 diamond");
    }

    #[tokio::test]
    async fn test_closed_connection_reported() {
        let broker = Arc::new(RequestBroker::default());
        let tools = ConnectionTools::new(
            broker,
            ConnectionId::new(),
            JobId::new(),
            Duration::from_secs(1),
        );
        let result = tools
            .invoke(&call(RUN_COMMAND_TOOL, serde_json::json!({"command": "/say hi"})))
            .await;
        assert_eq!(result, "command failed: connection closed");
    }

    #[tokio::test]
    async fn test_bad_calls() {
        let tools = ConnectionTools::new(
            Arc::new(RequestBroker::default()),
            ConnectionId::new(),
            JobId::new(),
            Duration::from_secs(1),
        );
        assert_eq!(tools.definitions()[0].name, RUN_COMMAND_TOOL);
        assert_eq!(
            tools.invoke(&call("teleport", serde_json::json!({}))).await,
            "unknown tool: teleport"
        );
        assert_eq!(
            tools.invoke(&call(RUN_COMMAND_TOOL, serde_json::json!({}))).await,
            "command failed: missing 'command' argument"
        );
        assert!(NoTools.definitions().is_empty());
    }
}
