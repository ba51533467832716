//! Model completion capability
//!
//! The decision loop only needs `complete(system, conversation, tools)`.
//! `OpenAiCompatClient` implements it against any OpenAI-compatible
//! `/chat/completions` endpoint, routing by model-id prefix.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{ModelConfig, ProviderConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Conversation entry (the system prompt is passed separately)
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        name: String,
        content: String,
    },
}

/// Tool declaration shown to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One model turn: narrative text and/or tool calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("No API key configured for {0}")]
    MissingApiKey(&'static str),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Malformed completion: {0}")]
    Malformed(String),
}

/// Where a model id is sent and under which name
#[derive(Debug)]
pub struct Route<'a> {
    pub provider_name: &'static str,
    pub provider: &'a ProviderConfig,
    pub model: String,
}

/// Resolve a prefixed model id to a provider endpoint
pub fn route<'a>(models: &'a ModelConfig, model: &str) -> Result<Route<'a>, ModelError> {
    if let Some(name) = model.strip_prefix("openai-") {
        Ok(Route {
            provider_name: "openai",
            provider: &models.openai,
            model: name.to_string(),
        })
    } else if model.starts_with("deepseek-") {
        Ok(Route {
            provider_name: "deepseek",
            provider: &models.deepseek,
            model: models
                .deepseek_name
                .clone()
                .unwrap_or_else(|| model.to_string()),
        })
    } else if let Some(name) = model.strip_prefix("anthropic-") {
        Ok(Route {
            provider_name: "anthropic",
            provider: &models.anthropic,
            model: name.to_string(),
        })
    } else {
        Err(ModelError::InvalidModel(model.to_string()))
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

/// Models send arguments as a JSON string; blank means no arguments
fn parse_arguments(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn to_wire(system_prompt: &str, conversation: &[ChatMessage]) -> Vec<WireMessage> {
    let mut messages = vec![WireMessage::text("system", system_prompt)];

    for message in conversation {
        messages.push(match message {
            ChatMessage::User(text) => WireMessage::text("user", text),
            ChatMessage::Assistant { text, tool_calls } => WireMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text.clone()) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        tool_calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                kind: function_kind(),
                                function: WireFunction {
                                    name: call.name.clone(),
                                    arguments: call.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: None,
            },
            ChatMessage::Tool {
                call_id, content, ..
            } => WireMessage {
                role: "tool".to_string(),
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            },
        });
    }

    messages
}

fn from_wire(message: WireMessage) -> Completion {
    Completion {
        text: message.content.unwrap_or_default(),
        tool_calls: message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            })
            .collect(),
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    models: ModelConfig,
}

impl OpenAiCompatClient {
    pub fn new(models: ModelConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("Vigil/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, models })
    }

    async fn send(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, ModelError> {
        let route = route(&self.models, model)?;
        let api_key = route
            .provider
            .api_key
            .as_deref()
            .ok_or(ModelError::MissingApiKey(route.provider_name))?;

        let body = WireRequest {
            model: &route.model,
            messages: to_wire(system_prompt, conversation),
            tools: tools
                .iter()
                .map(|spec| WireTool {
                    kind: "function",
                    function: spec,
                })
                .collect(),
        };

        let url = format!(
            "{}/chat/completions",
            route.provider.base_url.trim_end_matches('/')
        );
        debug!(
            "Completion request to {} ({} messages, {} tools)",
            route.provider_name,
            body.messages.len(),
            body.tools.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Malformed("response has no choices".to_string()))?;

        Ok(from_wire(choice.message))
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        conversation: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion> {
        Ok(self.send(model, system_prompt, conversation, tools).await?)
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned completions and records what it was shown
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<Completion, String>>>,
        /// Fallback once the script runs out
        repeat: Option<Completion>,
        pub calls: Mutex<Vec<(String, Vec<ChatMessage>, Vec<String>)>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Completion>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(Ok).collect()),
                repeat: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(error: &str) -> Self {
            Self {
                replies: Mutex::new(VecDeque::from(vec![Err(error.to_string())])),
                repeat: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn forever(reply: Completion) -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                repeat: Some(reply),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(
            &self,
            model: &str,
            _system_prompt: &str,
            conversation: &[ChatMessage],
            tools: &[ToolSpec],
        ) -> Result<Completion> {
            self.calls.lock().unwrap().push((
                model.to_string(),
                conversation.to_vec(),
                tools.iter().map(|t| t.name.clone()).collect(),
            ));
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(e)) => Err(anyhow::anyhow!("{}", e)),
                None => self
                    .repeat
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("script exhausted")),
            }
        }
    }

    pub fn text(reply: &str) -> Completion {
        Completion {
            text: reply.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn call(id: &str, name: &str, arguments: Value) -> Completion {
        Completion {
            text: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn models() -> ModelConfig {
        let provider = |url: &str| ProviderConfig {
            base_url: url.to_string(),
            api_key: Some("key".to_string()),
        };
        ModelConfig {
            openai: provider("https://api.openai.com/v1"),
            deepseek: provider("https://api.deepseek.com/v1"),
            deepseek_name: None,
            anthropic: provider("https://api.anthropic.com/v1"),
        }
    }

    #[test]
    fn test_route_by_prefix() {
        let models = models();

        let openai = route(&models, "openai-gpt-4o").unwrap();
        assert_eq!(openai.provider_name, "openai");
        assert_eq!(openai.model, "gpt-4o");

        let deepseek = route(&models, "deepseek-chat").unwrap();
        assert_eq!(deepseek.provider_name, "deepseek");
        assert_eq!(deepseek.model, "deepseek-chat");

        let anthropic = route(&models, "anthropic-claude-3-5-haiku-latest").unwrap();
        assert_eq!(anthropic.model, "claude-3-5-haiku-latest");

        assert!(matches!(
            route(&models, "llama-3"),
            Err(ModelError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_deepseek_name_override() {
        let mut models = models();
        models.deepseek_name = Some("deepseek-r1-distill".to_string());
        assert_eq!(
            route(&models, "deepseek-chat").unwrap().model,
            "deepseek-r1-distill"
        );
    }

    #[test]
    fn test_to_wire_shapes_tool_turns() {
        let conversation = vec![
            ChatMessage::User("run it".to_string()),
            ChatMessage::Assistant {
                text: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call_1".to_string(),
                    name: "getInstanceMetric".to_string(),
                    arguments: json!({"metricName": "cpu_utilization", "periodInSeconds": 300}),
                }],
            },
            ChatMessage::Tool {
                call_id: "call_1".to_string(),
                name: "getInstanceMetric".to_string(),
                content: "ok".to_string(),
            },
        ];

        let wire = serde_json::to_value(to_wire("be brief", &conversation)).unwrap();

        assert_eq!(wire[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["content"], Value::Null);
        assert_eq!(wire[2]["tool_calls"][0]["type"], "function");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "getInstanceMetric");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_from_wire_parses_tool_calls() {
        let message: WireMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "a", "type": "function", "function": {"name": "getPostgresExtensions", "arguments": ""}},
                {"id": "b", "type": "function", "function": {"name": "getInstanceLogs", "arguments": "{\"periodInSeconds\": 60}"}}
            ]
        }))
        .unwrap();

        let completion = from_wire(message);

        assert_eq!(completion.text, "");
        assert_eq!(completion.tool_calls.len(), 2);
        assert_eq!(completion.tool_calls[0].arguments, json!({}));
        assert_eq!(completion.tool_calls[1].arguments, json!({"periodInSeconds": 60}));
    }

    #[test]
    fn test_from_wire_tolerates_null_tool_calls() {
        let message: WireMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "All healthy.",
            "tool_calls": null
        }))
        .unwrap();

        let completion = from_wire(message);
        assert_eq!(completion.text, "All healthy.");
        assert!(completion.tool_calls.is_empty());
    }
}
