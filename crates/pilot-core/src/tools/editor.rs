//! Editor tools: let the agent read, replace and run the open workflow.

use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::editor::EditorBridge;
use crate::tools::{ToolExecutionResult, ToolFuture, ToolSchema, ToolSet};

pub const TOOL_SET_ID: &str = "comfyui";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetWorkflowInput {
    workflow_json: String,
}

#[derive(Debug, Deserialize)]
struct LoadWorkflowInput {
    workflow: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteWorkflowInput {
    /// JSON number; fractional counts are rounded.
    #[serde(default)]
    batch_count: Option<f64>,
}

impl ExecuteWorkflowInput {
    fn batch_count(&self) -> u32 {
        self.batch_count
            .filter(|count| count.is_finite())
            .map_or(1, |count| count.round().clamp(1.0, f64::from(u32::MAX)) as u32)
    }
}

pub struct EditorToolSet {
    bridge: EditorBridge,
    cancel: CancellationToken,
}

impl EditorToolSet {
    pub fn new(bridge: EditorBridge) -> Self {
        Self {
            bridge,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops any run being followed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn run(&self, tool_name: &str, args: Value) -> anyhow::Result<Value> {
        match tool_name {
            "get_workflow" => {
                let content = self.bridge.fetch_document().await?;
                Ok(json!({ "success": true, "content": content }))
            }
            "set_workflow" => {
                let input: SetWorkflowInput = serde_json::from_value(args)?;
                self.bridge.load_document(&input.workflow_json).await?;
                Ok(json!({ "success": true, "message": "Workflow updated" }))
            }
            "load_workflow" => {
                let input: LoadWorkflowInput = serde_json::from_value(args)?;
                let document = serde_json::to_string(&input.workflow)?;
                self.bridge.load_document(&document).await?;
                Ok(json!({ "success": true, "message": "Workflow updated" }))
            }
            "execute_workflow" => {
                let input: ExecuteWorkflowInput = if args.is_null() {
                    ExecuteWorkflowInput::default()
                } else {
                    serde_json::from_value(args)?
                };
                let report = self
                    .bridge
                    .execute(input.batch_count(), &self.cancel)
                    .await?;
                let mut value = serde_json::to_value(&report)?;
                value["success"] = json!(report.succeeded());
                Ok(value)
            }
            other => anyhow::bail!("Unknown tool: {other}"),
        }
    }
}

impl ToolSet for EditorToolSet {
    fn id(&self) -> &str {
        TOOL_SET_ID
    }

    fn name(&self) -> &str {
        "ComfyUI"
    }

    fn description(&self) -> &str {
        "Read, replace and run the workflow open in the editor"
    }

    fn tools(&self) -> Vec<ToolSchema> {
        vec![
            ToolSchema::new(
                "execute_workflow",
                Some("Run the current workflow and return its result"),
                json!({
                    "type": "object",
                    "properties": {
                        "batchCount": { "type": "number", "description": "Number of batches", "default": 1 }
                    }
                }),
            ),
            ToolSchema::new(
                "get_workflow",
                Some("Get the JSON content of the current workflow"),
                json!({ "type": "object", "properties": {} }),
            ),
            ToolSchema::new(
                "set_workflow",
                Some("Replace the current workflow with a JSON string"),
                json!({
                    "type": "object",
                    "properties": {
                        "workflowJson": { "type": "string", "description": "Workflow JSON string" }
                    },
                    "required": ["workflowJson"]
                }),
            ),
            ToolSchema::new(
                "load_workflow",
                Some("Replace the current workflow with a JSON object"),
                json!({
                    "type": "object",
                    "properties": {
                        "workflow": { "type": "object", "description": "Workflow JSON object" }
                    },
                    "required": ["workflow"]
                }),
            ),
        ]
    }

    fn execute<'a>(
        &'a self,
        _tool_call_id: &'a str,
        tool_name: &'a str,
        args: Value,
    ) -> ToolFuture<'a> {
        Box::pin(async move {
            match self.run(tool_name, args).await {
                Ok(result) => ToolExecutionResult::success(result),
                Err(err) => ToolExecutionResult::failure(format!("{err:#}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::editor::bridge::{GET_WORKFLOW, NEW_WORKFLOW, SET_WORKFLOW, WORKFLOW_DATA};
    use crate::editor::{ChannelPort, EditorEnd, RpcChannel};

    fn tool_set() -> (EditorToolSet, EditorEnd) {
        let (port, end, inbound) = ChannelPort::pair();
        let (rpc, _pushes) = RpcChannel::new(Arc::new(port));
        let rpc = Arc::new(rpc);
        tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.pump(inbound).await }
        });
        (
            EditorToolSet::new(EditorBridge::new(rpc, Duration::from_secs(5))),
            end,
        )
    }

    #[test]
    fn test_schemas_are_complete() {
        let (port, _end, _inbound) = ChannelPort::pair();
        let (rpc, _pushes) = RpcChannel::new(Arc::new(port));
        let set = EditorToolSet::new(EditorBridge::new(Arc::new(rpc), Duration::from_secs(1)));

        let names: Vec<String> = set.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["execute_workflow", "get_workflow", "set_workflow", "load_workflow"]
        );
        assert!(set.has_tool("load_workflow"));
        assert!(!set.has_tool("bash"));
    }

    #[tokio::test]
    async fn test_get_workflow_returns_content() {
        let (set, mut end) = tool_set();
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            assert_eq!(request.kind, GET_WORKFLOW);
            end.reply(&request, WORKFLOW_DATA, json!({ "nodes": [] }));
            end
        });

        let result = set.execute("c1", "get_workflow", json!({})).await;
        drop(editor.await.unwrap());
        assert!(result.success);
        assert_eq!(result.result.unwrap()["content"], "{\n  \"nodes\": []\n}");
    }

    #[tokio::test]
    async fn test_set_workflow_opens_then_sets() {
        let (set, mut end) = tool_set();
        let editor = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let request = end.recv().await.unwrap();
                seen.push((request.kind.clone(), request.payload.clone()));
                end.reply(&request, "ok", Value::Null);
            }
            (seen, end)
        });

        let result = set
            .execute("c1", "set_workflow", json!({ "workflowJson": "{\"nodes\":[1]}" }))
            .await;
        let (seen, _end) = editor.await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(seen[0].0, NEW_WORKFLOW);
        assert_eq!(seen[1], (SET_WORKFLOW.to_string(), json!({ "nodes": [1] })));
    }

    #[tokio::test]
    async fn test_bad_input_is_a_failure_result() {
        let (set, _end) = tool_set();
        let missing = set.execute("c1", "set_workflow", json!({})).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("workflowJson"));

        let unknown = set.execute("c2", "delete_everything", json!({})).await;
        assert_eq!(unknown.error.as_deref(), Some("Unknown tool: delete_everything"));
    }

    #[test]
    fn test_batch_count_accepts_any_number() {
        let parse = |args: Value| serde_json::from_value::<ExecuteWorkflowInput>(args).map(|i| i.batch_count());
        assert_eq!(parse(json!({})).unwrap(), 1);
        assert_eq!(parse(json!({ "batchCount": 3 })).unwrap(), 3);
        assert_eq!(parse(json!({ "batchCount": 2.0 })).unwrap(), 2);
        assert_eq!(parse(json!({ "batchCount": 0 })).unwrap(), 1);
        assert!(parse(json!({ "batchCount": "two" })).is_err());
    }

    #[tokio::test]
    async fn test_execute_with_bad_arguments_sends_nothing() {
        let (set, mut end) = tool_set();
        let result = set
            .execute("c1", "execute_workflow", json!({ "batchCount": "two" }))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid type"));
        assert!(end.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_execute_with_float_batch_count() {
        let (set, mut end) = tool_set();
        let editor = tokio::spawn(async move {
            let request = end.recv().await.unwrap();
            end.reply(&request, "comfy-pilot:execute-result", json!({ "promptId": "p1" }));
            (request.payload, end)
        });

        let result = set
            .execute("c1", "execute_workflow", json!({ "batchCount": 2.0 }))
            .await;
        let (payload, _end) = editor.await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(payload, json!({ "batchCount": 2 }));
    }

    #[tokio::test]
    async fn test_detached_editor_fails_fast() {
        let (set, end) = tool_set();
        drop(end);
        let result = set.execute("c1", "get_workflow", json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Editor is not ready"));
    }
}
