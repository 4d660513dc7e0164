use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Cache fetch failed: {0}")]
    CacheFetch(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidToolArguments { tool: String, reason: String },

    #[error("Reasoning loop aborted: {reason}")]
    LoopAborted { reason: String },

    #[error("Decision validation failed: {0}")]
    DecisionValidation(String),

    #[error("Order submission failed for {symbol}: {reason}")]
    OrderSubmission { symbol: String, reason: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl AgentError {
    /// True for failures worth another attempt (timeouts, transient I/O).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Llm(_) | AgentError::MarketData(_) | AgentError::Broker(_)
        )
    }
}
