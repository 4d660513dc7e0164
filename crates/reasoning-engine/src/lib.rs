//! The reasoning loop: drives one conversation against the LLM, executing
//! at most one tool per turn, until the model produces a final answer or an
//! iteration/context budget forces an abort.

use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    AgentError, ChatMessage, Conversation, LlmProvider, LlmReply, LoopOutcome, ToolCallRecord,
};
use dashmap::DashMap;
use tokio::time::timeout;
use tool_registry::ToolRegistry;
use uuid::Uuid;

/// Budgets and timeouts bounding a single loop run
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum tool-call turns per run
    pub max_iterations: u32,
    /// Maximum cumulative conversation size in characters
    pub max_context_chars: usize,
    /// Timeout for one model call
    pub llm_timeout_seconds: u64,
    /// Attempts per model call (timeouts are retryable)
    pub llm_attempts: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_context_chars: 24_000,
            llm_timeout_seconds: 90,
            llm_attempts: 2,
        }
    }
}

/// Loop state per conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ExecutingTool,
    Done,
    Aborted,
}

/// Explicit keyed store of conversation history: thread_id → ordered turns.
/// A new thread id starts an empty history; running a thread again after a
/// final answer appends rather than replaces.
#[derive(Default)]
pub struct ThreadStore {
    threads: DashMap<String, Vec<ChatMessage>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
        }
    }

    pub fn new_thread_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn history(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.threads
            .get(thread_id)
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }

    pub fn turn_count(&self, thread_id: &str) -> usize {
        self.threads.get(thread_id).map(|t| t.len()).unwrap_or(0)
    }

    fn replace(&self, thread_id: &str, turns: Vec<ChatMessage>) {
        self.threads.insert(thread_id.to_string(), turns);
    }
}

pub struct ReasoningEngine {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    threads: ThreadStore,
    config: LoopConfig,
}

impl ReasoningEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: LoopConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            threads: ThreadStore::new(),
            config,
        }
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    /// Run the loop for one new user message on the given thread. All prior
    /// turns of the thread are replayed to the model on every call. The
    /// returned conversation carries the full updated history, the recorded
    /// tool calls of this run, and the terminal outcome.
    pub async fn run(
        &self,
        thread_id: &str,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<Conversation, AgentError> {
        let mut turns = self.threads.history(thread_id);
        if turns.is_empty() {
            turns.push(ChatMessage::system(system_prompt));
        }
        turns.push(ChatMessage::user(user_message));

        let schemas = self.registry.schemas();
        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut state = LoopState::AwaitingModel;
        let outcome;
        let mut final_answer = None;

        loop {
            debug_assert_eq!(state, LoopState::AwaitingModel);

            let context_chars: usize = turns.iter().map(|t| t.size_chars()).sum();
            if context_chars > self.config.max_context_chars {
                tracing::warn!(
                    "Thread {}: context budget exceeded ({} > {} chars), aborting",
                    thread_id,
                    context_chars,
                    self.config.max_context_chars
                );
                state = LoopState::Aborted;
                outcome = LoopOutcome::Aborted {
                    reason: format!(
                        "context budget exceeded ({} > {} chars)",
                        context_chars, self.config.max_context_chars
                    ),
                };
                break;
            }

            let reply = self.call_model(&turns, &schemas).await?;

            match reply {
                LlmReply::Answer(text) => {
                    turns.push(ChatMessage::assistant(text.clone()));
                    final_answer = Some(text);
                    state = LoopState::Done;
                    outcome = LoopOutcome::Done;
                    break;
                }
                LlmReply::ToolCall(call) => {
                    if tool_calls.len() as u32 >= self.config.max_iterations {
                        tracing::warn!(
                            "Thread {}: iteration budget of {} tool calls exhausted, aborting",
                            thread_id,
                            self.config.max_iterations
                        );
                        state = LoopState::Aborted;
                        outcome = LoopOutcome::Aborted {
                            reason: format!(
                                "iteration budget of {} tool calls exhausted",
                                self.config.max_iterations
                            ),
                        };
                        break;
                    }

                    state = LoopState::ExecutingTool;
                    tracing::debug!(
                        "Thread {}: {:?} — running {} (call {})",
                        thread_id,
                        state,
                        call.name,
                        tool_calls.len() + 1
                    );
                    turns.push(ChatMessage::assistant_tool_request(call.clone()));

                    // Misuse (unknown tool, bad arguments) is fed back to the
                    // model as the tool result so it can correct course; the
                    // turn still consumes iteration budget.
                    let result_text = match self.registry.invoke(&call.name, &call.arguments).await
                    {
                        Ok(text) => text,
                        Err(e @ AgentError::UnknownTool(_))
                        | Err(e @ AgentError::InvalidToolArguments { .. }) => {
                            tracing::warn!("Thread {}: {}", thread_id, e);
                            format!("Error: {}", e)
                        }
                        Err(e) => return Err(e),
                    };

                    tool_calls.push(ToolCallRecord {
                        seq: tool_calls.len() as u32,
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        compressed_result: result_text.clone(),
                    });
                    turns.push(ChatMessage::tool_result(call.id, result_text));
                    state = LoopState::AwaitingModel;
                }
            }
        }

        debug_assert!(matches!(state, LoopState::Done | LoopState::Aborted));

        // Retain the full history, aborted runs included, so the thread
        // can be inspected and continued.
        self.threads.replace(thread_id, turns.clone());

        Ok(Conversation {
            thread_id: thread_id.to_string(),
            turns,
            tool_calls,
            outcome,
            final_answer,
        })
    }

    /// One model call with a per-call timeout; timeouts are retryable up to
    /// the configured attempt budget.
    async fn call_model(
        &self,
        turns: &[ChatMessage],
        schemas: &[agent_core::ToolSchema],
    ) -> Result<LlmReply, AgentError> {
        let per_call = Duration::from_secs(self.config.llm_timeout_seconds);
        let mut last_error = None;

        for attempt in 1..=self.config.llm_attempts {
            match timeout(per_call, self.provider.complete(turns, schemas)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        "Model call timed out after {:?} (attempt {}/{})",
                        per_call,
                        attempt,
                        self.config.llm_attempts
                    );
                    last_error = Some(AgentError::Llm(format!(
                        "model call timed out after {:?}",
                        per_call
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AgentError::Llm("model call failed".to_string())))
    }
}
