//! Google generative-language adapter.
//!
//! Function calls in this dialect are identified by name rather than by call
//! id, so the adapter uses the function name as the call id when threading
//! tool results back.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    CallContext, ChatBackend, ChatMessage, ClientParams, ProviderAdapter, ProviderError,
    ProviderResponse, Role, RunConfig, ToolCallRequest, Turn, TurnOutput, classify_status,
    classify_transport, drive_conversation, reply_envelope_schema,
};
use crate::sandbox::ToolSpec;
use crate::task::{ResponseFormat, Task};

pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Adapter for Google-style services.
pub struct GoogleAdapter {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleAdapter {
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
                .unwrap_or_else(|| GOOGLE_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn convert_messages(
        messages: &[ChatMessage],
    ) -> Result<(Option<WireContent>, Vec<WireContent>), ProviderError> {
        let mut system = None;
        let mut contents: Vec<WireContent> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    system = Some(WireContent {
                        role: None,
                        parts: vec![WirePart::Text {
                            text: message.content.clone(),
                        }],
                    });
                }
                Role::User => {
                    let mut parts = vec![WirePart::Text {
                        text: message.content.clone(),
                    }];
                    for attachment in &message.attachments {
                        let data = attachment
                            .data_url
                            .split_once("base64,")
                            .map(|(_, d)| d.to_string())
                            .unwrap_or_default();
                        parts.push(WirePart::InlineData {
                            inline_data: InlineData {
                                mime_type: attachment.mime.clone(),
                                data,
                            },
                        });
                    }
                    contents.push(WireContent {
                        role: Some("user"),
                        parts,
                    });
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(WirePart::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        parts.push(WirePart::FunctionCall {
                            function_call: FunctionCall {
                                name: call.name.clone(),
                                args: call.arguments.clone(),
                            },
                        });
                    }
                    contents.push(WireContent {
                        role: Some("model"),
                        parts,
                    });
                }
                Role::Tool => {
                    contents.push(WireContent {
                        role: Some("user"),
                        parts: vec![WirePart::FunctionResponse {
                            function_response: FunctionResponse {
                                name: message.tool_call_id.clone().unwrap_or_default(),
                                response: serde_json::json!({
                                    "output": message.content,
                                }),
                            },
                        }],
                    });
                }
            }
        }

        Ok((system, contents))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTools>,
}

#[derive(Serialize)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Serialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

#[async_trait::async_trait]
impl ChatBackend for GoogleAdapter {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        run: &RunConfig,
        messages: &[ChatMessage],
        format: &ResponseFormat,
        tools: &[ToolSpec],
    ) -> Result<Turn, ProviderError> {
        let (system_instruction, contents) = Self::convert_messages(messages)?;

        let (response_mime_type, response_schema) = match format {
            ResponseFormat::Text(_) => (None, None),
            ResponseFormat::Schema(schema) => (
                Some("application/json"),
                Some(reply_envelope_schema(schema)),
            ),
        };

        let request = GenerateContentRequest {
            system_instruction,
            contents,
            generation_config: Some(GenerationConfig {
                temperature: run.params.temperature,
                top_p: run.params.top_p,
                max_output_tokens: run.params.max_tokens,
                response_mime_type,
                response_schema,
            }),
            tools: if tools.is_empty() {
                Vec::new()
            } else {
                vec![WireTools {
                    function_declarations: tools
                        .iter()
                        .map(|tool| FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        })
                        .collect(),
                }]
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, run.model, self.api_key
        );
        let send = self.client.post(url).json(&request).send();

        let response = tokio::select! {
            sent = send => sent.map_err(classify_transport)?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body: GenerateContentResponse = response.json().await.map_err(classify_transport)?;
        let (input_tokens, output_tokens) = body
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((None, None));

        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::UnmarshalResponse {
                reason: "response contained no candidates".to_string(),
                raw: String::new(),
                stop_reason: None,
            })?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                calls.push(ToolCallRequest {
                    id: call.name.clone(),
                    name: call.name,
                    arguments: call.args,
                });
            }
        }

        let output = if calls.is_empty() {
            TurnOutput::Final {
                content: text,
                stop_reason: candidate.finish_reason,
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
impl ProviderAdapter for GoogleAdapter {
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
    fn assistant_role_maps_to_model() {
        let messages = vec![
            ChatMessage::user("q", vec![]),
            ChatMessage::assistant("a", vec![]),
        ];
        let (_, contents) = GoogleAdapter::convert_messages(&messages).unwrap();
        assert_eq!(contents[0].role, Some("user"));
        assert_eq!(contents[1].role, Some("model"));
    }

    #[test]
    fn tool_result_becomes_function_response() {
        let messages = vec![ChatMessage::tool_result("calc", "42")];
        let (_, contents) = GoogleAdapter::convert_messages(&messages).unwrap();
        let json = serde_json::to_value(&contents[0].parts).unwrap();
        assert_eq!(json[0]["functionResponse"]["name"], "calc");
        assert_eq!(json[0]["functionResponse"]["response"]["output"], "42");
    }
}
