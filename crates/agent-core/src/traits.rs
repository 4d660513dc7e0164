use async_trait::async_trait;

use crate::{AgentError, ChatMessage, ToolCallRequest};

/// JSON schema advertised to the model for one callable tool
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the parameters
    pub parameters: serde_json::Value,
}

/// What the model returned for one turn: either a final answer or exactly
/// one tool invocation. The backing provider only ever emits sequential,
/// single tool calls.
#[derive(Debug, Clone)]
pub enum LlmReply {
    Answer(String),
    ToolCall(ToolCallRequest),
}

/// Trait for chat-completion providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<LlmReply, AgentError>;
}
