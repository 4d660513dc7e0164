use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV bar data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Real-time quote snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub latest_trading_day: String,
}

/// News article with provider-scored sentiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub source: String,
    pub published_at: String,
    pub sentiment_score: f64,
    pub sentiment_label: String,
}

/// Bar granularity for market data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Min30,
    Min60,
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    /// Wire name as Alpha Vantage expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1min",
            Interval::Min5 => "5min",
            Interval::Min15 => "15min",
            Interval::Min30 => "30min",
            Interval::Min60 => "60min",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
        }
    }

    /// Sub-daily granularities must always be fetched fresh.
    pub fn is_intraday(&self) -> bool {
        matches!(
            self,
            Interval::Min1
                | Interval::Min5
                | Interval::Min15
                | Interval::Min30
                | Interval::Min60
        )
    }
}

/// Directional read from a single-symbol analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSignal {
    Bullish,
    Neutral,
    Bearish,
}

impl AnalysisSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSignal::Bullish => "bullish",
            AnalysisSignal::Neutral => "neutral",
            AnalysisSignal::Bearish => "bearish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "bullish" => Some(AnalysisSignal::Bullish),
            "neutral" => Some(AnalysisSignal::Neutral),
            "bearish" => Some(AnalysisSignal::Bearish),
            _ => None,
        }
    }
}

/// One point-in-time run of the pipeline over holdings + watchlist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub holdings: Vec<String>,
    pub watchlist: Vec<String>,
}

impl PortfolioSnapshot {
    pub fn new(holdings: Vec<String>, watchlist: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            taken_at: Utc::now(),
            holdings,
            watchlist,
        }
    }

    /// Distinct symbols across holdings and watchlist, holdings first.
    pub fn symbols(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.holdings
            .iter()
            .chain(self.watchlist.iter())
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect()
    }
}

/// Structured findings for one symbol, produced by one reasoning-loop run.
/// Immutable once created; superseded only by a newer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolAnalysis {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub signal: AnalysisSignal,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub summary: String,
    /// Thread id of the conversation that produced this record
    pub conversation_id: String,
}

/// Per-symbol action inside a portfolio decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionAction::Buy => write!(f, "BUY"),
            DecisionAction::Sell => write!(f, "SELL"),
            DecisionAction::Hold => write!(f, "HOLD"),
        }
    }
}

impl DecisionAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(DecisionAction::Buy),
            "SELL" => Some(DecisionAction::Sell),
            "HOLD" => Some(DecisionAction::Hold),
            _ => None,
        }
    }
}

/// One (symbol, action, rationale) line of a portfolio decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub symbol: String,
    pub action: DecisionAction,
    pub rationale: String,
}

/// Portfolio-level decision document synthesized from a full analysis set.
/// References the exact analyses consumed; timestamp is strictly later than
/// every referenced analysis timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<DecisionEntry>,
    pub analysis_ids: Vec<Uuid>,
    pub conversation_id: String,
}

impl PortfolioDecision {
    /// Build a decision over `analyses`, clamping the timestamp so it always
    /// post-dates the newest referenced analysis (sub-millisecond runs would
    /// otherwise tie).
    pub fn new(
        snapshot_id: Uuid,
        entries: Vec<DecisionEntry>,
        analyses: &[SymbolAnalysis],
        conversation_id: String,
    ) -> Self {
        let newest = analyses.iter().map(|a| a.timestamp).max();
        let mut timestamp = Utc::now();
        if let Some(newest) = newest {
            if timestamp <= newest {
                timestamp = newest + Duration::milliseconds(1);
            }
        }
        Self {
            id: Uuid::new_v4(),
            snapshot_id,
            timestamp,
            entries,
            analysis_ids: analyses.iter().map(|a| a.id).collect(),
            conversation_id,
        }
    }

    pub fn entry_for(&self, symbol: &str) -> Option<&DecisionEntry> {
        self.entries.iter().find(|e| e.symbol == symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Submitted,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(OrderStatus::Submitted),
            "filled" => Some(OrderStatus::Filled),
            "rejected" => Some(OrderStatus::Rejected),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Brokerage order record, linked back to the decision that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One turn of a conversation. Tool-request turns carry `tool_calls`;
/// tool-result turns carry the originating `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_request(call: ToolCallRequest) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: String::new(),
            tool_calls: Some(vec![call]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Approximate context cost of this turn (serialized length).
    pub fn size_chars(&self) -> usize {
        let calls = self
            .tool_calls
            .as_ref()
            .map(|cs| {
                cs.iter()
                    .map(|c| c.name.len() + c.arguments.to_string().len())
                    .sum::<usize>()
            })
            .unwrap_or(0);
        self.content.len() + calls
    }
}

/// Tool invocation as recorded in a finished conversation: immutable,
/// exclusively owned by the conversation that issued it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub seq: u32,
    pub name: String,
    pub arguments: serde_json::Value,
    pub compressed_result: String,
}

/// Terminal state of a reasoning-loop run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopOutcome {
    Done,
    Aborted { reason: String },
}

/// A finished reasoning-loop run over one thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub thread_id: String,
    pub turns: Vec<ChatMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub outcome: LoopOutcome,
    pub final_answer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_symbols_dedupe_and_uppercase() {
        let snap = PortfolioSnapshot::new(
            vec!["aapl".into(), "NVDA".into()],
            vec!["nvda".into(), "GOOG".into(), "".into()],
        );
        assert_eq!(snap.symbols(), vec!["AAPL", "NVDA", "GOOG"]);
    }

    #[test]
    fn decision_timestamp_post_dates_analyses() {
        let snap = Uuid::new_v4();
        let analysis = SymbolAnalysis {
            id: Uuid::new_v4(),
            snapshot_id: snap,
            symbol: "AAPL".into(),
            timestamp: Utc::now(),
            signal: AnalysisSignal::Bullish,
            confidence: 0.8,
            support: None,
            resistance: None,
            summary: "up".into(),
            conversation_id: "t1".into(),
        };
        let decision = PortfolioDecision::new(
            snap,
            vec![DecisionEntry {
                symbol: "AAPL".into(),
                action: DecisionAction::Buy,
                rationale: "momentum".into(),
            }],
            std::slice::from_ref(&analysis),
            "t2".into(),
        );
        assert!(decision.timestamp > analysis.timestamp);
        assert_eq!(decision.analysis_ids, vec![analysis.id]);
    }

    #[test]
    fn intraday_intervals_flagged() {
        assert!(Interval::Min5.is_intraday());
        assert!(!Interval::Daily.is_intraday());
        assert_eq!(Interval::Min60.as_str(), "60min");
    }

    #[test]
    fn action_parsing_is_case_insensitive() {
        assert_eq!(DecisionAction::parse(" buy "), Some(DecisionAction::Buy));
        assert_eq!(DecisionAction::parse("HOLD"), Some(DecisionAction::Hold));
        assert_eq!(DecisionAction::parse("short"), None);
    }
}
