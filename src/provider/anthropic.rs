//! Anthropic messages-API adapter.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    CallContext, ChatBackend, ChatMessage, ClientParams, ProviderAdapter, ProviderError,
    ProviderResponse, Role, RunConfig, ToolCallRequest, Turn, TurnOutput, classify_status,
    classify_transport, drive_conversation, reply_envelope_schema,
};
use crate::sandbox::ToolSpec;
use crate::task::{ResponseFormat, Task};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// The messages API requires an explicit output budget.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for Anthropic-style services.
pub struct AnthropicAdapter {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, params: ClientParams) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(params.request_timeout)
            .build()
            .map_err(ProviderError::Network)?;
        Ok(Self {
            name: name.into(),
            client,
            api_key: params.api_key,
            base_url: params
                .base_url
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Splits the conversation into the separate system string and the
    /// alternating user/assistant message list the messages API expects.
    /// Tool results travel as `tool_result` blocks inside a user message.
    fn convert_messages(
        messages: &[ChatMessage],
    ) -> Result<(Option<String>, Vec<WireMessage>), ProviderError> {
        let mut system = None;
        let mut wire: Vec<WireMessage> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    system = Some(message.content.clone());
                }
                Role::User => {
                    let mut content = vec![ContentBlock::Text {
                        text: message.content.clone(),
                    }];
                    for attachment in &message.attachments {
                        if !attachment.mime.starts_with("image/") {
                            return Err(ProviderError::FeatureNotSupported(format!(
                                "attachment {:?} has type {} but this service only accepts images",
                                attachment.name, attachment.mime
                            )));
                        }
                        let data = attachment
                            .data_url
                            .split_once("base64,")
                            .map(|(_, d)| d.to_string())
                            .unwrap_or_default();
                        content.push(ContentBlock::Image {
                            source: ImageSource {
                                kind: "base64",
                                media_type: attachment.mime.clone(),
                                data,
                            },
                        });
                    }
                    wire.push(WireMessage {
                        role: "user",
                        content,
                    });
                }
                Role::Assistant => {
                    let mut content = Vec::new();
                    if !message.content.is_empty() {
                        content.push(ContentBlock::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        content.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                    wire.push(WireMessage {
                        role: "assistant",
                        content,
                    });
                }
                Role::Tool => {
                    wire.push(WireMessage {
                        role: "user",
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                            content: message.content.clone(),
                        }],
                    });
                }
            }
        }

        Ok((system, wire))
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[async_trait::async_trait]
impl ChatBackend for AnthropicAdapter {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        run: &RunConfig,
        messages: &[ChatMessage],
        format: &ResponseFormat,
        tools: &[ToolSpec],
    ) -> Result<Turn, ProviderError> {
        let (mut system, wire_messages) = Self::convert_messages(messages)?;

        // No native structured-output directive here; the envelope schema is
        // delivered as a system instruction instead.
        if let ResponseFormat::Schema(schema) = format {
            let directive = format!(
                "Respond with a single raw JSON object (no markdown fences) conforming to this \
                 JSON Schema:\n{}",
                reply_envelope_schema(schema)
            );
            system = Some(match system {
                Some(existing) => format!("{existing}\n\n{directive}"),
                None => directive,
            });
        }

        let request = MessagesRequest {
            model: &run.model,
            max_tokens: run.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: wire_messages,
            temperature: run.params.temperature,
            top_p: run.params.top_p,
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect(),
        };

        let send = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send();

        let response = tokio::select! {
            sent = send => sent.map_err(classify_transport)?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            // The messages API signals transient overload with a dedicated
            // error type on 529 as well as the usual statuses.
            if status == 529 {
                return Err(ProviderError::Retryable(format!("HTTP {status}: {body}")));
            }
            return Err(classify_status(status, body));
        }

        let body: MessagesResponse = response.json().await.map_err(classify_transport)?;
        let (input_tokens, output_tokens) = body
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((None, None));

        let mut text = String::new();
        let mut calls = Vec::new();
        for block in body.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input,
                }),
                ResponseBlock::Unknown => {}
            }
        }

        let output = if calls.is_empty() {
            TurnOutput::Final {
                content: text,
                stop_reason: body.stop_reason,
            }
        } else {
            TurnOutput::ToolCalls {
                calls,
                content: text,
            }
        };

        Ok(Turn {
            output,
            input_tokens,
            output_tokens,
        })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        cx: &CallContext,
        run: &RunConfig,
        task: &Task,
    ) -> Result<ProviderResponse, ProviderError> {
        drive_conversation(self, cx, run, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_lifted_out() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello", vec![]),
        ];
        let (system, wire) = AnthropicAdapter::convert_messages(&messages).unwrap();
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].role, "user");
    }

    #[test]
    fn tool_results_become_user_tool_result_blocks() {
        let messages = vec![
            ChatMessage::assistant(
                "",
                vec![ToolCallRequest {
                    id: "tu_1".into(),
                    name: "calc".into(),
                    arguments: serde_json::json!({"x": 1}),
                }],
            ),
            ChatMessage::tool_result("tu_1", "2"),
        ];
        let (_, wire) = AnthropicAdapter::convert_messages(&messages).unwrap();
        assert_eq!(wire[0].role, "assistant");
        assert_eq!(wire[1].role, "user");

        let json = serde_json::to_value(&wire[1].content).unwrap();
        assert_eq!(json[0]["type"], "tool_result");
        assert_eq!(json[0]["tool_use_id"], "tu_1");
    }
}
