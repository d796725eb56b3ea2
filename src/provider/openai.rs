//! OpenAI-compatible chat-completions adapter.
//!
//! One adapter covers every service that speaks the OpenAI chat-completions
//! dialect; DeepSeek, Mistral, xAI, Alibaba and Moonshot differ only in their
//! endpoint and model ids, so the configuration layer instantiates this
//! adapter with the matching base URL.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    CallContext, ChatBackend, ChatMessage, ClientParams, ProviderAdapter, ProviderError,
    ProviderResponse, Role, RunConfig, ToolCallRequest, Turn, TurnOutput, classify_status,
    classify_transport, drive_conversation, reply_envelope_schema,
};
use crate::sandbox::ToolSpec;
use crate::task::{ResponseFormat, Task};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";
pub const ALIBABA_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const MOONSHOT_BASE_URL: &str = "https://api.moonshot.ai/v1";

/// Adapter for OpenAI and OpenAI-compatible services.
pub struct OpenAiAdapter {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    /// Creates an adapter against the official OpenAI endpoint (unless the
    /// client params override the base URL).
    pub fn new(name: impl Into<String>, params: ClientParams) -> Result<Self, ProviderError> {
        Self::compatible(name, params, OPENAI_BASE_URL)
    }

    /// Creates an adapter for a compatible vendor with its own endpoint.
    pub fn compatible(
        name: impl Into<String>,
        params: ClientParams,
        default_base_url: &str,
    ) -> Result<Self, ProviderError> {
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
                .unwrap_or_else(|| default_base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn convert_messages(messages: &[ChatMessage]) -> Result<Vec<WireMessage>, ProviderError> {
        messages.iter().map(WireMessage::try_from).collect()
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize, Debug)]
struct WireMessage {
    role: &'static str,
    content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl TryFrom<&ChatMessage> for WireMessage {
    type Error = ProviderError;

    fn try_from(message: &ChatMessage) -> Result<Self, ProviderError> {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        // Attachments ride along as content parts; only images are accepted
        // by the chat-completions dialect.
        let content = if message.attachments.is_empty() {
            serde_json::Value::String(message.content.clone())
        } else {
            let mut parts = vec![serde_json::json!({"type": "text", "text": message.content})];
            for attachment in &message.attachments {
                if !attachment.mime.starts_with("image/") {
                    return Err(ProviderError::FeatureNotSupported(format!(
                        "attachment {:?} has type {} but this service only accepts images",
                        attachment.name, attachment.mime
                    )));
                }
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": attachment.data_url},
                }));
            }
            serde_json::Value::Array(parts)
        };

        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: "function",
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };

        Ok(WireMessage {
            role,
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        })
    }
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Debug)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize, Debug)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunctionCall,
}

#[derive(Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
    #[serde(default)]
    param: Option<String>,
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiAdapter {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        run: &RunConfig,
        messages: &[ChatMessage],
        format: &ResponseFormat,
        tools: &[ToolSpec],
    ) -> Result<Turn, ProviderError> {
        let response_format = match format {
            ResponseFormat::Text(_) => None,
            ResponseFormat::Schema(schema) => Some(serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "reply",
                    "schema": reply_envelope_schema(schema),
                    "strict": true,
                },
            })),
        };

        let request = ChatCompletionRequest {
            model: &run.model,
            messages: Self::convert_messages(messages)?,
            temperature: run.params.temperature,
            top_p: run.params.top_p,
            max_tokens: run.params.max_tokens,
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
            response_format,
        };

        let send = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();

        let response = tokio::select! {
            sent = send => sent.map_err(classify_transport)?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            // Parameter rejections come back as a 400 with the offending
            // parameter named.
            if let Ok(wire) = serde_json::from_str::<WireError>(&body)
                && wire.error.param.is_some()
            {
                return Err(ProviderError::InvalidModelParams(wire.error.message));
            }
            return Err(classify_status(status, body));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(classify_transport)?;
        let (input_tokens, output_tokens) = body
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::UnmarshalResponse {
                reason: "response contained no choices".to_string(),
                raw: String::new(),
                stop_reason: None,
            })?;

        let output = if choice.message.tool_calls.is_empty() {
            TurnOutput::Final {
                content: choice.message.content.unwrap_or_default(),
                stop_reason: choice.finish_reason,
            }
        } else {
            let mut calls = Vec::new();
            for call in choice.message.tool_calls {
                let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
                    ProviderError::UnmarshalResponse {
                        reason: format!("tool call arguments are not valid JSON: {e}"),
                        raw: call.function.arguments.clone(),
                        stop_reason: choice.finish_reason.clone(),
                    }
                })?;
                calls.push(ToolCallRequest {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                });
            }
            TurnOutput::ToolCalls {
                calls,
                content: choice.message.content.unwrap_or_default(),
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
impl ProviderAdapter for OpenAiAdapter {
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
    use crate::provider::Attachment;

    #[test]
    fn plain_message_serializes_as_string_content() {
        let wire = WireMessage::try_from(&ChatMessage::user("hello", vec![])).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn image_attachment_becomes_content_part() {
        let message = ChatMessage::user(
            "look",
            vec![Attachment {
                name: "pic.png".into(),
                mime: "image/png".into(),
                data_url: "data:image/png;base64,AAAA".into(),
            }],
        );
        let wire = WireMessage::try_from(&message).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
    }

    #[test]
    fn non_image_attachment_is_not_supported() {
        let message = ChatMessage::user(
            "read",
            vec![Attachment {
                name: "doc.pdf".into(),
                mime: "application/pdf".into(),
                data_url: "data:application/pdf;base64,AAAA".into(),
            }],
        );
        let err = WireMessage::try_from(&message).unwrap_err();
        assert!(matches!(err, ProviderError::FeatureNotSupported(_)));
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let wire = WireMessage::try_from(&ChatMessage::tool_result("call_1", "output")).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
    }
}
