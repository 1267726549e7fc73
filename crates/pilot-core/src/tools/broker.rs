//! Tool-call resolution.
//!
//! Turns an `AGENT_TOOL_CALL_REQUEST` into the [`ToolDecision`] the session
//! sends back. Server-side tools (neither client nor MCP) only need the
//! user's consent; local tools are looked up in the [`ToolRegistry`],
//! checked against the persisted [`ToolConfigDocument`], and executed.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{ToolCallRequestData, ToolDecision, ToolOutcome};
use crate::tools::{ToolExecutionResult, ToolRegistry};

pub const TOOL_CONFIG_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPolicy {
    #[default]
    AskEveryTime,
    AutoExecute,
}

impl ExecutionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPolicy::AskEveryTime => "ask-every-time",
            ExecutionPolicy::AutoExecute => "auto-execute",
        }
    }
}

impl std::fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ask-every-time" | "ask" => Ok(ExecutionPolicy::AskEveryTime),
            "auto-execute" | "auto" => Ok(ExecutionPolicy::AutoExecute),
            other => anyhow::bail!(
                "Unknown execution policy '{other}' (expected ask-every-time or auto-execute)"
            ),
        }
    }
}

/// Per tool set settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSetConfig {
    pub id: String,
    pub enabled: bool,
    #[serde(default)]
    pub execution_policy: ExecutionPolicy,
}

impl ToolSetConfig {
    /// Settings for a set that has never been configured.
    pub fn unconfigured(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            execution_policy: ExecutionPolicy::AskEveryTime,
        }
    }
}

/// Versioned tool configuration, persisted in the client state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfigDocument {
    pub version: String,
    #[serde(default)]
    pub tool_sets: Vec<ToolSetConfig>,
}

impl Default for ToolConfigDocument {
    fn default() -> Self {
        Self {
            version: TOOL_CONFIG_VERSION.to_string(),
            tool_sets: Vec::new(),
        }
    }
}

impl ToolConfigDocument {
    pub fn is_current(&self) -> bool {
        self.version == TOOL_CONFIG_VERSION
    }

    /// Settings for `id`, or the unconfigured defaults.
    pub fn tool_set(&self, id: &str) -> ToolSetConfig {
        self.tool_sets
            .iter()
            .find(|set| set.id == id)
            .cloned()
            .unwrap_or_else(|| ToolSetConfig::unconfigured(id))
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.tool_set(id).enabled
    }

    /// Updates the settings of `id`, creating the entry if needed.
    /// `None` keeps the current value.
    pub fn update(&mut self, id: &str, enabled: Option<bool>, policy: Option<ExecutionPolicy>) {
        let pos = match self.tool_sets.iter().position(|set| set.id == id) {
            Some(pos) => pos,
            None => {
                self.tool_sets.push(ToolSetConfig::unconfigured(id));
                self.tool_sets.len() - 1
            }
        };
        let entry = &mut self.tool_sets[pos];
        if let Some(enabled) = enabled {
            entry.enabled = enabled;
        }
        if let Some(policy) = policy {
            entry.execution_policy = policy;
        }
    }
}

/// Approval future.
pub type ApprovalFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Asks the user whether a tool call may run.
pub trait Approver: Send + Sync {
    fn approve<'a>(&'a self, request_id: &'a str, request: &'a ToolCallRequestData)
    -> ApprovalFuture<'a>;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Approver for AutoApprove {
    fn approve<'a>(
        &'a self,
        _request_id: &'a str,
        _request: &'a ToolCallRequestData,
    ) -> ApprovalFuture<'a> {
        Box::pin(async { true })
    }
}

pub struct ToolBroker {
    /// Sets can be withdrawn while calls are in flight; calls work on a snapshot.
    registry: RwLock<ToolRegistry>,
    config: ToolConfigDocument,
    approver: Arc<dyn Approver>,
}

impl ToolBroker {
    pub fn new(registry: ToolRegistry, config: ToolConfigDocument, approver: Arc<dyn Approver>) -> Self {
        Self {
            registry: RwLock::new(registry),
            config,
            approver,
        }
    }

    fn snapshot(&self) -> ToolRegistry {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of the registered tool sets.
    pub fn tool_set_ids(&self) -> Vec<String> {
        self.snapshot().ids()
    }

    /// Withdraws a tool set, e.g. when the editor behind it goes away.
    /// Its tools stop being advertised and later calls to them fail.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(id)
            .is_some();
        if removed {
            info!(set = %id, "tool set withdrawn");
        }
        removed
    }

    /// Schemas of every enabled tool set, sent with each user message.
    pub fn enabled_schemas(&self) -> Vec<crate::tools::ToolSchema> {
        self.snapshot().schemas(|id| self.config.is_enabled(id))
    }

    /// Decides and, when allowed, runs a tool call.
    pub async fn resolve(&self, request_id: &str, request: &ToolCallRequestData) -> ToolDecision {
        if !request.is_client_tool && !request.is_mcp_tool {
            return if self.approver.approve(request_id, request).await {
                debug!(tool = %request.tool_name, "server tool approved");
                ToolDecision::Allow(None)
            } else {
                info!(tool = %request.tool_name, "server tool denied");
                ToolDecision::Deny
            };
        }

        let registry = self.snapshot();
        let Some(set_id) = registry
            .find_by_tool_name(&request.tool_name)
            .map(|set| set.id().to_string())
        else {
            warn!(tool = %request.tool_name, "no tool set provides requested tool");
            return failure(format!("Unknown tool: {}", request.tool_name));
        };
        let settings = self.config.tool_set(&set_id);
        if !settings.enabled {
            warn!(tool = %request.tool_name, set = %set_id, "tool set disabled");
            return failure(format!("Tool set {set_id} is disabled"));
        }

        if settings.execution_policy == ExecutionPolicy::AskEveryTime
            && !self.approver.approve(request_id, request).await
        {
            info!(tool = %request.tool_name, "local tool denied");
            return ToolDecision::Deny;
        }

        let args = match parse_args(&request.tool_args) {
            Ok(args) => args,
            Err(err) => {
                warn!(tool = %request.tool_name, error = %err, "invalid tool arguments");
                return failure(format!("Invalid tool arguments: {err}"));
            }
        };

        let outcome = registry
            .execute_by_name(&request.tool_call_id, &request.tool_name, args)
            .await;
        debug!(tool = %request.tool_name, success = outcome.success, "tool executed");
        into_decision(outcome)
    }
}

fn failure(message: String) -> ToolDecision {
    ToolDecision::Allow(Some(ToolOutcome::Failure(message)))
}

fn parse_args(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

fn into_decision(outcome: ToolExecutionResult) -> ToolDecision {
    if outcome.success {
        let result = match outcome.result {
            Some(Value::String(text)) => text,
            Some(value) => value.to_string(),
            None => "null".to_string(),
        };
        ToolDecision::Allow(Some(ToolOutcome::Success(result)))
    } else {
        failure(
            outcome
                .error
                .unwrap_or_else(|| "Tool execution failed".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::tools::testing::EchoSet;

    struct Counting {
        answer: bool,
        asked: AtomicUsize,
    }

    impl Counting {
        fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                asked: AtomicUsize::new(0),
            })
        }
    }

    impl Approver for Counting {
        fn approve<'a>(
            &'a self,
            _request_id: &'a str,
            _request: &'a ToolCallRequestData,
        ) -> ApprovalFuture<'a> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer;
            Box::pin(async move { answer })
        }
    }

    fn request(tool: &str, args: &str, client: bool, mcp: bool) -> ToolCallRequestData {
        ToolCallRequestData {
            tool_call_id: "c1".to_string(),
            tool_name: tool.to_string(),
            tool_args: args.to_string(),
            is_client_tool: client,
            is_mcp_tool: mcp,
        }
    }

    fn broker(config: ToolConfigDocument, approver: Arc<dyn Approver>) -> ToolBroker {
        let registry = ToolRegistry::new().with_set(Arc::new(EchoSet { id: "echo", tool: "say" }));
        ToolBroker::new(registry, config, approver)
    }

    #[tokio::test]
    async fn test_server_tool_needs_consent_only() {
        let yes = broker(ToolConfigDocument::default(), Counting::new(true));
        assert_eq!(
            yes.resolve("r", &request("search", "{}", false, false)).await,
            ToolDecision::Allow(None)
        );

        let no = broker(ToolConfigDocument::default(), Counting::new(false));
        assert_eq!(
            no.resolve("r", &request("search", "{}", false, false)).await,
            ToolDecision::Deny
        );
    }

    #[tokio::test]
    async fn test_ask_policy_consults_approver() {
        let approver = Counting::new(true);
        let broker = broker(ToolConfigDocument::default(), Arc::<Counting>::clone(&approver));

        let decision = broker.resolve("r", &request("say", r#"{"x":1}"#, true, false)).await;
        let ToolDecision::Allow(Some(ToolOutcome::Success(result))) = decision else {
            panic!("expected success, got {decision:?}");
        };
        let value: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(value["args"]["x"], 1);
        assert_eq!(approver.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auto_execute_skips_approver() {
        let mut config = ToolConfigDocument::default();
        config.update("echo", None, Some(ExecutionPolicy::AutoExecute));
        let approver = Counting::new(false);
        let broker = broker(config, Arc::<Counting>::clone(&approver));

        let decision = broker.resolve("r", &request("say", "", true, false)).await;
        assert!(matches!(decision, ToolDecision::Allow(Some(ToolOutcome::Success(_)))));
        assert_eq!(approver.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denied_local_tool() {
        let broker = broker(ToolConfigDocument::default(), Counting::new(false));
        assert_eq!(
            broker.resolve("r", &request("say", "{}", true, false)).await,
            ToolDecision::Deny
        );
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_set_fails_without_asking() {
        let mut config = ToolConfigDocument::default();
        config.update("echo", Some(false), None);
        let approver = Counting::new(true);
        let broker = broker(config, Arc::<Counting>::clone(&approver));

        let disabled = broker.resolve("r", &request("say", "{}", true, false)).await;
        assert_eq!(
            disabled,
            ToolDecision::Allow(Some(ToolOutcome::Failure("Tool set echo is disabled".to_string())))
        );
        let unknown = broker.resolve("r", &request("nope", "{}", false, true)).await;
        assert!(matches!(unknown, ToolDecision::Allow(Some(ToolOutcome::Failure(_)))));
        assert_eq!(approver.asked.load(Ordering::SeqCst), 0);
        assert!(broker.enabled_schemas().is_empty());
    }

    #[tokio::test]
    async fn test_bad_arguments_and_tool_failure() {
        let broker = broker(ToolConfigDocument::default(), Arc::new(AutoApprove));

        let bad = broker.resolve("r", &request("say", "{nope", true, false)).await;
        let ToolDecision::Allow(Some(ToolOutcome::Failure(error))) = bad else {
            panic!("expected failure");
        };
        assert!(error.starts_with("Invalid tool arguments"));

        let failed = broker.resolve("r", &request("say", r#"{"fail":true}"#, true, false)).await;
        assert_eq!(
            failed,
            ToolDecision::Allow(Some(ToolOutcome::Failure("say failed".to_string())))
        );
    }

    #[tokio::test]
    async fn test_unregistered_set_is_withdrawn() {
        let broker = broker(ToolConfigDocument::default(), Arc::new(AutoApprove));
        assert_eq!(broker.tool_set_ids(), vec!["echo"]);
        assert_eq!(broker.enabled_schemas().len(), 1);

        assert!(broker.unregister("echo"));
        assert!(!broker.unregister("echo"));
        assert!(broker.tool_set_ids().is_empty());
        assert!(broker.enabled_schemas().is_empty());

        let decision = broker.resolve("r", &request("say", "{}", true, false)).await;
        assert_eq!(
            decision,
            ToolDecision::Allow(Some(ToolOutcome::Failure("Unknown tool: say".to_string())))
        );
    }

    #[test]
    fn test_config_update_and_serde() {
        let mut config = ToolConfigDocument::default();
        assert!(config.is_enabled("anything"));
        config.update("comfyui", Some(false), None);
        config.update("comfyui", None, Some(ExecutionPolicy::AutoExecute));
        assert_eq!(config.tool_sets.len(), 1);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["version"], "1.0.0");
        assert_eq!(value["toolSets"][0]["enabled"], false);
        assert_eq!(value["toolSets"][0]["executionPolicy"], "auto-execute");
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("auto".parse::<ExecutionPolicy>().unwrap(), ExecutionPolicy::AutoExecute);
        assert_eq!(
            "ask-every-time".parse::<ExecutionPolicy>().unwrap(),
            ExecutionPolicy::AskEveryTime
        );
        assert!("sometimes".parse::<ExecutionPolicy>().is_err());
    }
}
