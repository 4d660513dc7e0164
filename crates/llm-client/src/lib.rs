use std::time::Duration;

use agent_core::{
    AgentError, ChatMessage, ChatRole, LlmProvider, LlmReply, ToolCallRequest, ToolSchema,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// Chat-completions client configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("LLM_API_KEY").context("LLM_API_KEY not set")?,
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            temperature: std::env::var("LLM_TEMPERATURE")
                .unwrap_or_else(|_| "0.2".to_string())
                .parse()?,
            timeout_seconds: std::env::var("LLM_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            max_retries: 3,
        })
    }
}

/// OpenAI-compatible chat-completions client. The backing provider only
/// returns sequential, single tool calls; extras on the wire are dropped
/// with a warning.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds + 5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(LlmConfig::from_env()?))
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse, AgentError> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            let call = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .json(request)
                .send();

            match timeout(Duration::from_secs(self.config.timeout_seconds), call).await {
                Ok(Ok(response)) => {
                    if !response.status().is_success() {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        // Client errors won't improve on retry
                        if status.is_client_error() && status.as_u16() != 429 {
                            return Err(AgentError::Llm(format!("HTTP {}: {}", status, body)));
                        }
                        last_error = Some(format!("HTTP {}: {}", status, body));
                    } else {
                        return response
                            .json::<ChatCompletionResponse>()
                            .await
                            .map_err(|e| AgentError::Llm(e.to_string()));
                    }
                }
                Ok(Err(e)) => {
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    last_error = Some(format!(
                        "timed out after {}s",
                        self.config.timeout_seconds
                    ));
                }
            }

            if attempt < self.config.max_retries {
                let backoff = Duration::from_secs(2u64.pow(attempt.min(4)));
                tracing::warn!(
                    "LLM call attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    self.config.max_retries,
                    last_error.as_deref().unwrap_or("unknown"),
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(AgentError::Llm(format!(
            "LLM call failed after {} attempts: {}",
            self.config.max_retries,
            last_error.unwrap_or_else(|| "unknown".to_string())
        )))
    }
}

#[async_trait]
impl LlmProvider for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<LlmReply, AgentError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: self.config.temperature,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(WireTool::from).collect())
            },
        };

        let response = self.send(&request).await?;
        reply_from_response(response)
    }
}

fn reply_from_response(response: ChatCompletionResponse) -> Result<LlmReply, AgentError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Llm("Response contained no choices".to_string()))?;

    let message = choice.message;
    if let Some(mut calls) = message.tool_calls.filter(|c| !c.is_empty()) {
        if calls.len() > 1 {
            tracing::warn!(
                "Provider returned {} tool calls; executing only the first (sequential-only contract)",
                calls.len()
            );
        }
        let call = calls.remove(0);
        let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
            .map_err(|e| {
                AgentError::Llm(format!(
                    "Tool call arguments are not valid JSON: {} ({})",
                    call.function.arguments, e
                ))
            })?;
        return Ok(LlmReply::ToolCall(ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments,
        }));
    }

    match message.content {
        Some(content) if !content.trim().is_empty() => Ok(LlmReply::Answer(content)),
        _ => Err(AgentError::Llm(
            "Response carried neither content nor a tool call".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: Some(msg.content.clone()),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        call_type: "function".to_string(),
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ToolSchema,
}

impl From<&ToolSchema> for WireTool {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: schema.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded string per the chat-completions wire format
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_answer_parsed_from_content() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"NVDA looks overbought."}}]}"#,
        )
        .unwrap();

        match reply_from_response(response).unwrap() {
            LlmReply::Answer(text) => assert!(text.contains("overbought")),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[test]
    fn single_tool_call_parsed_with_json_arguments() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null,
                "tool_calls":[{"id":"call_1","type":"function",
                  "function":{"name":"get_rsi","arguments":"{\"symbol\":\"AAPL\",\"period\":14}"}}]}}]}"#,
        )
        .unwrap();

        match reply_from_response(response).unwrap() {
            LlmReply::ToolCall(call) => {
                assert_eq!(call.name, "get_rsi");
                assert_eq!(call.arguments["symbol"], "AAPL");
                assert_eq!(call.arguments["period"], 14);
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn extra_tool_calls_are_dropped() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null,
                "tool_calls":[
                  {"id":"call_1","type":"function","function":{"name":"get_rsi","arguments":"{}"}},
                  {"id":"call_2","type":"function","function":{"name":"get_sma","arguments":"{}"}}
                ]}}]}"#,
        )
        .unwrap();

        match reply_from_response(response).unwrap() {
            LlmReply::ToolCall(call) => assert_eq!(call.name, "get_rsi"),
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn malformed_arguments_surface_as_llm_error() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null,
                "tool_calls":[{"id":"c","type":"function",
                  "function":{"name":"get_rsi","arguments":"{not json"}}]}}]}"#,
        )
        .unwrap();

        assert!(matches!(
            reply_from_response(response),
            Err(AgentError::Llm(_))
        ));
    }

    #[test]
    fn tool_result_turns_serialize_with_call_id() {
        let wire = WireMessage::from(&ChatMessage::tool_result("call_9", "RSI(14) = 61.2"));
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_9");
        assert_eq!(json["content"], "RSI(14) = 61.2");
    }
}
