//! Typed editor operations over [`RpcChannel`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EditorConfig;
use crate::editor::poll::{HistoryProbe, PollOutcome, PollPolicy, poll_until};
use crate::editor::rpc::{EditorMessage, RpcChannel, RpcError};

pub const GET_WORKFLOW: &str = "comfy-pilot:get-workflow";
pub const WORKFLOW_DATA: &str = "comfy-pilot:workflow-data";
pub const SET_WORKFLOW: &str = "comfy-pilot:set-workflow";
pub const NEW_WORKFLOW: &str = "comfy-pilot:new-workflow";
pub const EXECUTE_WORKFLOW: &str = "comfy-pilot:execute-workflow";
pub const PING: &str = "comfy-pilot:ping";
pub const GRAPH_CHANGED: &str = "comfy-pilot:workflow-graph-changed";

/// Where a run ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Queued; no status endpoint to follow it.
    Queued,
    Completed {
        outputs: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Polling gave up. The run may still finish.
    Unknown { attempts: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub prompt_id: String,
    #[serde(flatten)]
    pub status: ExecutionStatus,
}

impl ExecutionReport {
    /// `false` only for a run that completed with an error.
    pub fn succeeded(&self) -> bool {
        !matches!(
            self.status,
            ExecutionStatus::Completed { error: Some(_), .. }
        )
    }
}

/// Status-endpoint settings for following runs.
#[derive(Debug, Clone)]
struct StatusTracking {
    probe: HistoryProbe,
    policy: PollPolicy,
}

#[derive(Clone)]
pub struct EditorBridge {
    rpc: Arc<RpcChannel>,
    timeout: Duration,
    tracking: Option<StatusTracking>,
}

impl EditorBridge {
    pub fn new(rpc: Arc<RpcChannel>, timeout: Duration) -> Self {
        Self {
            rpc,
            timeout,
            tracking: None,
        }
    }

    /// Builds a bridge with the configured timeout and, if a status URL is
    /// set, run tracking.
    ///
    /// # Errors
    /// Returns an error if the status URL is invalid.
    pub fn from_config(rpc: Arc<RpcChannel>, config: &EditorConfig) -> Result<Self> {
        let bridge = Self::new(rpc, config.rpc_timeout());
        Ok(match config.status_base()? {
            Some(base) => bridge.with_status_tracking(
                HistoryProbe::new(reqwest::Client::new(), base),
                config.poll_policy(),
            ),
            None => bridge,
        })
    }

    #[must_use]
    pub fn with_status_tracking(mut self, probe: HistoryProbe, policy: PollPolicy) -> Self {
        self.tracking = Some(StatusTracking { probe, policy });
        self
    }

    pub fn rpc(&self) -> &Arc<RpcChannel> {
        &self.rpc
    }

    pub fn is_ready(&self) -> bool {
        self.rpc.is_ready()
    }

    /// Connectivity probe.
    ///
    /// # Errors
    /// Returns the [`RpcError`] of the ping call.
    pub async fn ping(&self) -> Result<(), RpcError> {
        self.rpc.call(PING, Value::Null, self.timeout).await.map(|_| ())
    }

    /// Current document, pretty-printed.
    ///
    /// # Errors
    /// Returns an error if the call fails, the reply is not workflow data,
    /// or the editor sends no document.
    pub async fn fetch_document(&self) -> Result<String> {
        let reply = self
            .rpc
            .request(GET_WORKFLOW, Value::Null, self.timeout)
            .await
            .context("Failed to fetch workflow")?;
        if reply.kind != WORKFLOW_DATA {
            anyhow::bail!("Unexpected reply to workflow request: {}", reply.kind);
        }
        let payload = reply.payload;
        if payload.is_null() {
            anyhow::bail!("Editor returned no workflow");
        }
        serde_json::to_string_pretty(&payload).context("Failed to encode workflow")
    }

    /// Replaces the current document.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    pub async fn set_document(&self, document: Value) -> Result<()> {
        self.rpc
            .call(SET_WORKFLOW, document, self.timeout)
            .await
            .context("Failed to set workflow")?;
        Ok(())
    }

    /// Opens a new document tab and fills it with `document` unless blank.
    ///
    /// # Errors
    /// Returns an error if `document` is not JSON or a call fails.
    pub async fn load_document(&self, document: &str) -> Result<()> {
        let parsed = if document.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(document).context("Workflow is not valid JSON")?)
        };

        self.rpc
            .call(NEW_WORKFLOW, Value::Null, self.timeout)
            .await
            .context("Failed to open new workflow")?;
        if let Some(parsed) = parsed {
            self.set_document(parsed).await?;
        }
        Ok(())
    }

    /// Queues a run and, when a status endpoint is configured, follows it.
    ///
    /// # Errors
    /// Returns an error if queueing fails. Polling never fails the call.
    pub async fn execute(&self, batch_count: u32, cancel: &CancellationToken) -> Result<ExecutionReport> {
        let reply = self
            .rpc
            .call(
                EXECUTE_WORKFLOW,
                json!({ "batchCount": batch_count.max(1) }),
                self.timeout,
            )
            .await
            .context("Failed to queue workflow")?;
        let prompt_id = reply
            .get("promptId")
            .and_then(Value::as_str)
            .context("Editor did not return a prompt id")?
            .to_string();
        info!(prompt_id = %prompt_id, batch_count, "workflow queued");

        let Some(tracking) = &self.tracking else {
            return Ok(ExecutionReport {
                prompt_id,
                status: ExecutionStatus::Queued,
            });
        };

        let probe = &tracking.probe;
        let id = prompt_id.as_str();
        let outcome = poll_until(tracking.policy, cancel, move |_| probe.fetch(id)).await;
        let status = match outcome {
            PollOutcome::Ready(entry) => completed(&entry),
            PollOutcome::Exhausted { attempts } => {
                info!(prompt_id = %prompt_id, attempts, "gave up polling run status");
                ExecutionStatus::Unknown { attempts }
            }
            PollOutcome::Cancelled => ExecutionStatus::Cancelled,
        };
        debug!(prompt_id = %prompt_id, status = ?status, "run finished");
        Ok(ExecutionReport { prompt_id, status })
    }
}

fn completed(entry: &Value) -> ExecutionStatus {
    let status = entry.get("status");
    let failed = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str)
        == Some("error");
    let error = failed.then(|| {
        status
            .and_then(|s| s.get("messages"))
            .map_or_else(|| "Execution failed".to_string(), Value::to_string)
    });
    ExecutionStatus::Completed {
        outputs: entry.get("outputs").cloned().unwrap_or(Value::Null),
        error,
    }
}

/// New document carried by a graph-changed push, pretty-printed.
pub fn changed_document(message: &EditorMessage) -> Option<String> {
    if message.kind != GRAPH_CHANGED || message.payload.is_null() {
        return None;
    }
    serde_json::to_string_pretty(&message.payload).ok()
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::editor::port::{ChannelPort, EditorEnd};

    fn bridge() -> (EditorBridge, EditorEnd) {
        let (port, end, inbound) = ChannelPort::pair();
        let (rpc, _pushes) = RpcChannel::new(Arc::new(port));
        let rpc = Arc::new(rpc);
        tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.pump(inbound).await }
        });
        (EditorBridge::new(rpc, Duration::from_secs(5)), end)
    }

    #[tokio::test]
    async fn test_fetch_document_pretty_prints() {
        let (bridge, mut end) = bridge();
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            assert_eq!(request.kind, GET_WORKFLOW);
            end.reply(&request, WORKFLOW_DATA, json!({ "nodes": [] }));
            end
        });

        let document = bridge.fetch_document().await.unwrap();
        assert_eq!(document, "{\n  \"nodes\": []\n}");
        drop(editor.await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_document_rejects_other_reply_types() {
        let (bridge, mut end) = bridge();
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            end.reply(&request, "comfy-pilot:pong", json!({ "nodes": [] }));
            end
        });

        let err = bridge.fetch_document().await.unwrap_err();
        assert!(err.to_string().contains("comfy-pilot:pong"), "{err:#}");
        drop(editor.await.unwrap());
    }

    #[tokio::test]
    async fn test_load_blank_document_only_opens_tab() {
        let (bridge, mut end) = bridge();
        let editor = tokio::spawn(async move {
            let mut kinds = Vec::new();
            while let Some(request) = end.recv().await {
                kinds.push(request.kind.clone());
                end.reply(&request, "ok", Value::Null);
                if kinds.len() == 3 {
                    break;
                }
            }
            (kinds, end)
        });

        bridge.load_document("  ").await.unwrap();
        bridge.load_document(r#"{"nodes":[1]}"#).await.unwrap();
        let (kinds, _end) = editor.await.unwrap();
        assert_eq!(kinds, vec![NEW_WORKFLOW, NEW_WORKFLOW, SET_WORKFLOW]);
    }

    #[tokio::test]
    async fn test_load_invalid_json_sends_nothing() {
        let (bridge, _end) = bridge();
        assert!(bridge.load_document("{nope").await.is_err());
        assert_eq!(bridge.rpc().pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_execute_without_tracking_is_queued() {
        let (bridge, mut end) = bridge();
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            assert_eq!(request.payload, json!({ "batchCount": 2 }));
            end.reply(&request, "comfy-pilot:execute-result", json!({ "promptId": "p9" }));
            end
        });

        let report = bridge.execute(2, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.prompt_id, "p9");
        assert_eq!(report.status, ExecutionStatus::Queued);
        assert!(report.succeeded());
        drop(editor.await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_follows_status_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "p1": { "outputs": { "9": {} }, "status": { "status_str": "success" } }
            })))
            .mount(&server)
            .await;

        let (bridge, mut end) = bridge();
        let probe = HistoryProbe::new(reqwest::Client::new(), url::Url::parse(&server.uri()).unwrap());
        let bridge = bridge.with_status_tracking(
            probe,
            PollPolicy {
                interval: Duration::from_millis(5),
                max_attempts: 3,
            },
        );
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            end.reply(&request, "comfy-pilot:execute-result", json!({ "promptId": "p1" }));
            end
        });

        let report = bridge.execute(1, &CancellationToken::new()).await.unwrap();
        drop(editor.await.unwrap());
        assert_eq!(
            report.status,
            ExecutionStatus::Completed {
                outputs: json!({ "9": {} }),
                error: None
            }
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["promptId"], "p1");
        assert_eq!(value["status"], "completed");
    }

    #[tokio::test]
    async fn test_execute_exhaustion_reports_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let (bridge, mut end) = bridge();
        let probe = HistoryProbe::new(reqwest::Client::new(), url::Url::parse(&server.uri()).unwrap());
        let bridge = bridge.with_status_tracking(
            probe,
            PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 2,
            },
        );
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            end.reply(&request, "comfy-pilot:execute-result", json!({ "promptId": "p1" }));
            end
        });

        let report = bridge.execute(1, &CancellationToken::new()).await.unwrap();
        drop(editor.await.unwrap());
        assert_eq!(report.status, ExecutionStatus::Unknown { attempts: 2 });
    }

    #[test]
    fn test_failed_run_carries_error() {
        let status = completed(&json!({
            "outputs": {},
            "status": { "status_str": "error", "messages": [["execution_error", {}]] }
        }));
        let ExecutionStatus::Completed { error: Some(error), .. } = status else {
            panic!("expected failure");
        };
        assert!(error.contains("execution_error"));
    }

    #[test]
    fn test_changed_document_only_for_graph_pushes() {
        let push = EditorMessage::push(GRAPH_CHANGED, json!({ "a": 1 }));
        assert_eq!(changed_document(&push).as_deref(), Some("{\n  \"a\": 1\n}"));
        assert!(changed_document(&EditorMessage::push("other", json!({}))).is_none());
        assert!(changed_document(&EditorMessage::push(GRAPH_CHANGED, Value::Null)).is_none());
    }
}
