//! Client-side tools the agent can call.
//!
//! Tools are grouped in tool sets. The agent sees their schemas on every
//! user message; calls come back as `AGENT_TOOL_CALL_REQUEST` frames and are
//! resolved by the [`broker`].

pub mod broker;
pub mod editor;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-Schema object subset describing a tool's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl InputSchema {
    /// Builds a schema from a JSON value.
    ///
    /// Anything that is not an object becomes an empty object schema.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::empty();
        };
        let properties = match map.remove("properties") {
            Some(Value::Object(properties)) => Some(properties),
            _ => None,
        };
        let required = match map.remove("required") {
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        };
        Self {
            kind: "object".to_string(),
            properties,
            required,
        }
    }

    pub fn empty() -> Self {
        Self {
            kind: "object".to_string(),
            properties: None,
            required: None,
        }
    }
}

/// Tool description sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: InputSchema,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: Option<&str>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.map(str::to_string),
            input_schema: InputSchema::from_value(input_schema),
        }
    }
}

/// Result of running a local tool, as reported back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Async tool execution future.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolExecutionResult> + Send + 'a>>;

/// A named group of tools executed on this client.
pub trait ToolSet: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn tools(&self) -> Vec<ToolSchema>;
    fn execute<'a>(&'a self, tool_call_id: &'a str, tool_name: &'a str, args: Value)
    -> ToolFuture<'a>;

    fn has_tool(&self, tool_name: &str) -> bool {
        self.tools().iter().any(|tool| tool.name == tool_name)
    }
}

/// Registered tool sets, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    sets: Vec<Arc<dyn ToolSet>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("sets", &self.ids())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_set(mut self, set: Arc<dyn ToolSet>) -> Self {
        self.register(set);
        self
    }

    /// Adds a tool set. A set with the same id is replaced in place.
    pub fn register(&mut self, set: Arc<dyn ToolSet>) {
        if let Some(pos) = self.sets.iter().position(|s| s.id() == set.id()) {
            self.sets[pos] = set;
        } else {
            self.sets.push(set);
        }
    }

    pub fn unregister(&mut self, id: &str) -> Option<Arc<dyn ToolSet>> {
        let pos = self.sets.iter().position(|s| s.id() == id)?;
        Some(self.sets.remove(pos))
    }

    pub fn ids(&self) -> Vec<String> {
        self.sets.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Schemas of every tool in sets accepted by `enabled`.
    pub fn schemas<F>(&self, enabled: F) -> Vec<ToolSchema>
    where
        F: Fn(&str) -> bool,
    {
        self.sets
            .iter()
            .filter(|set| enabled(set.id()))
            .flat_map(|set| set.tools())
            .collect()
    }

    /// First registered set that provides `tool_name`.
    pub fn find_by_tool_name(&self, tool_name: &str) -> Option<&Arc<dyn ToolSet>> {
        self.sets.iter().find(|set| set.has_tool(tool_name))
    }

    pub async fn execute_by_name(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
    ) -> ToolExecutionResult {
        match self.find_by_tool_name(tool_name) {
            Some(set) => set.execute(tool_call_id, tool_name, args).await,
            None => ToolExecutionResult::failure(format!("Unknown tool: {tool_name}")),
        }
    }
}
