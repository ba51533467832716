//! Tool registry
//!
//! Each diagnostic operation is a typed `Tool` whose argument struct derives
//! `JsonSchema`; the schema shown to the model and the deserialization of
//! model-issued arguments come from the same type. Toolset groups are merged
//! into one registry keyed by name, and a name declared twice is an error.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use vigil_tools::ToolResult;

use crate::model::ToolSpec;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool '{name}' is declared by both '{first}' and '{second}'")]
    DuplicateTool {
        name: String,
        first: String,
        second: String,
    },
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Arguments for tools that take none
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// A typed diagnostic operation
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: DeserializeOwned + JsonSchema + Send;

    fn description(&self) -> String;

    async fn call(&self, args: Self::Args) -> anyhow::Result<String>;
}

/// Type-erased handler stored in the registry
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: Value) -> ToolResult;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    async fn invoke(&self, args: Value) -> ToolResult {
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };

        let typed: T::Args = match serde_json::from_value(args) {
            Ok(typed) => typed,
            Err(e) => return ToolResult::error(format!("Invalid arguments for {}: {}", T::NAME, e)),
        };

        match self.call(typed).await {
            Ok(output) => ToolResult::success(output),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

fn parameters_for<A: JsonSchema>() -> Value {
    let mut schema = match serde_json::to_value(schemars::schema_for!(A)) {
        Ok(schema) => schema,
        Err(_) => serde_json::json!({"type": "object"}),
    };
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn of<T: Tool>(tool: T) -> Self {
        Self {
            name: T::NAME.to_string(),
            description: tool.description(),
            parameters: parameters_for::<T::Args>(),
            handler: Arc::new(tool),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A named set of tools, bound at construction to whatever it needs
pub trait ToolsetGroup: Send + Sync {
    fn group_name(&self) -> &str;
    fn tools(&self) -> Vec<ToolDescriptor>;
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, (String, ToolDescriptor)>,
}

impl ToolRegistry {
    /// Combine groups into one namespace; a name declared twice fails
    pub fn merge(groups: &[Box<dyn ToolsetGroup>]) -> Result<Self, ToolError> {
        let mut tools: BTreeMap<String, (String, ToolDescriptor)> = BTreeMap::new();

        for group in groups {
            for descriptor in group.tools() {
                if let Some((first, _)) = tools.get(&descriptor.name) {
                    return Err(ToolError::DuplicateTool {
                        name: descriptor.name,
                        first: first.clone(),
                        second: group.group_name().to_string(),
                    });
                }
                tools.insert(
                    descriptor.name.clone(),
                    (group.group_name().to_string(), descriptor),
                );
            }
        }

        Ok(Self { tools })
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.tools
            .get(name)
            .map(|(_, descriptor)| descriptor)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Resolve and run once. Unknown names come back as an error result.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolResult {
        match self.resolve(name) {
            Ok(descriptor) => descriptor.handler.invoke(args).await,
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|(_, d)| d.spec()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
