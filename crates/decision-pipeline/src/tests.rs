use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_core::{
    AgentError, ChatMessage, ChatRole, LlmProvider, LlmReply, OrderSide, ToolSchema,
};
use agent_store::AgentStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_trait::{
    BrokerAccount, BrokerClient, BrokerOrder, BrokerOrderRequest, BrokerOrderStatus,
    BrokerPosition,
};
use chrono::Utc;
use reasoning_engine::{LoopConfig, ReasoningEngine};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use tool_registry::ToolRegistry;

use crate::{execution::QuoteSource, Pipeline, PipelineConfig};

/// Provider that answers by matching a route key against the latest user
/// message, so replies stay deterministic under concurrent analysis runs.
struct KeyedProvider {
    routes: Mutex<Vec<(String, LlmReply)>>,
}

impl KeyedProvider {
    fn new(routes: Vec<(&str, LlmReply)>) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(
                routes
                    .into_iter()
                    .map(|(k, r)| (k.to_string(), r))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl LlmProvider for KeyedProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSchema],
    ) -> Result<LlmReply, AgentError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut routes = self.routes.lock().unwrap();
        let position = routes
            .iter()
            .position(|(key, _)| last_user.contains(key.as_str()))
            .ok_or_else(|| AgentError::Llm(format!("no scripted reply for: {}", last_user)))?;
        Ok(routes.remove(position).1)
    }
}

struct MockBroker {
    positions: Vec<BrokerPosition>,
    submitted: Mutex<Vec<BrokerOrderRequest>>,
    fail_symbols: Vec<String>,
    order_counter: AtomicUsize,
}

impl MockBroker {
    fn new(holdings: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            positions: holdings
                .iter()
                .map(|s| BrokerPosition {
                    symbol: s.to_string(),
                    qty: Decimal::new(10, 0),
                    avg_entry_price: Decimal::new(100, 0),
                    market_value: Decimal::new(1000, 0),
                    unrealized_pl: Decimal::ZERO,
                })
                .collect(),
            submitted: Mutex::new(Vec::new()),
            fail_symbols: Vec::new(),
            order_counter: AtomicUsize::new(0),
        })
    }

    fn failing_for(holdings: &[&str], fail: &[&str]) -> Arc<Self> {
        let mut broker = Self::new(holdings);
        Arc::get_mut(&mut broker).unwrap().fail_symbols =
            fail.iter().map(|s| s.to_string()).collect();
        broker
    }

    fn submitted_symbols(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.symbol.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_account(&self) -> Result<BrokerAccount> {
        Ok(BrokerAccount {
            id: "mock".to_string(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: Decimal::new(100_000, 0),
            cash: Decimal::new(50_000, 0),
            portfolio_value: Decimal::new(150_000, 0),
            trading_blocked: false,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.positions.clone())
    }

    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        if self.fail_symbols.contains(&order.symbol) {
            return Err(anyhow!("simulated broker rejection for {}", order.symbol));
        }
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(order.clone());
        Ok(BrokerOrder {
            id: format!("brk-{}", n),
            symbol: order.symbol,
            side: order.side,
            qty: order.qty,
            status: BrokerOrderStatus::Submitted,
            created_at: Utc::now(),
            filled_at: None,
            filled_qty: None,
            filled_avg_price: None,
        })
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder> {
        Err(anyhow!("no such order: {}", order_id))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "mock"
    }
}

struct FixedQuotes {
    prices: HashMap<String, f64>,
}

impl FixedQuotes {
    fn new(pairs: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            prices: pairs
                .iter()
                .map(|(s, p)| (s.to_string(), *p))
                .collect(),
        })
    }
}

#[async_trait]
impl QuoteSource for FixedQuotes {
    async fn latest_price(&self, symbol: &str) -> Result<f64, AgentError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| AgentError::MarketData(format!("no quote for {}", symbol)))
    }
}

fn analysis_json(signal: &str, confidence: f64) -> LlmReply {
    LlmReply::Answer(format!(
        r#"{{"signal":"{}","confidence":{},"support":150.0,"resistance":210.0,"summary":"Scripted analysis."}}"#,
        signal, confidence
    ))
}

fn decision_json(entries: &[(&str, &str)]) -> LlmReply {
    let decisions = entries
        .iter()
        .map(|(symbol, action)| {
            format!(
                r#"{{"symbol":"{}","action":"{}","rationale":"Scripted."}}"#,
                symbol, action
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    LlmReply::Answer(format!(r#"{{"decisions":[{}]}}"#, decisions))
}

async fn memory_store() -> Arc<AgentStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = AgentStore::new(pool);
    store.init_tables().await.unwrap();
    Arc::new(store)
}

fn pipeline(
    provider: Arc<dyn LlmProvider>,
    store: Arc<AgentStore>,
    broker: Arc<MockBroker>,
    quotes: Arc<dyn QuoteSource>,
    config: PipelineConfig,
) -> Pipeline {
    let engine = Arc::new(ReasoningEngine::new(
        provider,
        Arc::new(ToolRegistry::new()),
        LoopConfig::default(),
    ));
    Pipeline::new(engine, store, broker, quotes, config)
}

#[tokio::test]
async fn buy_aapl_hold_goog_places_exactly_one_order() {
    let provider = KeyedProvider::new(vec![
        ("Analyze AAPL", analysis_json("bullish", 0.8)),
        ("Analyze GOOG", analysis_json("neutral", 0.55)),
        ("Decide BUY", decision_json(&[("AAPL", "BUY"), ("GOOG", "HOLD")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::new(&[]);
    let quotes = FixedQuotes::new(&[("AAPL", 200.0), ("GOOG", 140.0)]);
    let config = PipelineConfig {
        watchlist: vec!["AAPL".to_string(), "GOOG".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    assert_eq!(report.analyses.len(), 2);
    assert!(report.failures.is_empty());

    let decision = report.decision.expect("decision produced");
    assert_eq!(decision.entries.len(), 2);
    assert_eq!(decision.analysis_ids.len(), 2);

    // Exactly one order: AAPL buy, 5 shares from $1000 notional at $200
    let execution = report.execution.expect("execution ran");
    assert_eq!(execution.orders.len(), 1);
    let order = &execution.orders[0];
    assert_eq!(order.symbol, "AAPL");
    assert_eq!(order.side, OrderSide::Buy);
    assert_eq!(order.qty, Decimal::new(5, 0));
    assert_eq!(broker.submitted_symbols(), vec!["AAPL"]);

    // Causal ordering: analysis < decision < order
    for analysis in &report.analyses {
        assert!(analysis.timestamp < decision.timestamp);
    }
    assert!(decision.timestamp < order.submitted_at);

    // Persisted state matches the report
    let stored_orders = store.orders_for_decision(decision.id).await.unwrap();
    assert_eq!(stored_orders.len(), 1);
    let stored_decision = store
        .decision_for_snapshot(report.snapshot.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_decision.id, decision.id);
}

#[tokio::test]
async fn reprocessing_a_decision_never_duplicates_orders() {
    let provider = KeyedProvider::new(vec![
        ("Analyze AAPL", analysis_json("bullish", 0.8)),
        ("Decide BUY", decision_json(&[("AAPL", "BUY")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::new(&[]);
    let quotes = FixedQuotes::new(&[("AAPL", 100.0)]);
    let config = PipelineConfig {
        watchlist: vec!["AAPL".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();
    let decision = report.decision.unwrap();
    assert_eq!(report.execution.unwrap().orders.len(), 1);

    // Second pass over the same decision: dedupe by decision + symbol + side
    let rerun = pipe.execution_stage().run(&decision).await;
    assert!(rerun.orders.is_empty());
    assert_eq!(rerun.skipped.len(), 1);
    assert!(rerun.skipped[0].reason.contains("already ordered"));
    assert_eq!(store.orders_for_decision(decision.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn analysis_failure_is_isolated_per_symbol() {
    let provider = KeyedProvider::new(vec![
        ("Analyze AAPL", LlmReply::Answer("not json at all".to_string())),
        ("Analyze GOOG", analysis_json("bearish", 0.65)),
        ("Decide BUY", decision_json(&[("GOOG", "SELL")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::new(&[]);
    let quotes = FixedQuotes::new(&[("GOOG", 140.0)]);
    let config = PipelineConfig {
        analysis_concurrency: 1,
        watchlist: vec!["AAPL".to_string(), "GOOG".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    assert_eq!(report.analyses.len(), 1);
    assert_eq!(report.analyses[0].symbol, "GOOG");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].symbol, "AAPL");

    // The surviving symbol still flows through decision and execution
    let decision = report.decision.expect("decision over partial set");
    assert_eq!(decision.entries.len(), 1);
    assert_eq!(report.execution.unwrap().orders.len(), 1);
}

#[tokio::test]
async fn invalid_decision_is_discarded_not_persisted() {
    let provider = KeyedProvider::new(vec![
        ("Analyze AAPL", analysis_json("bullish", 0.8)),
        ("Analyze GOOG", analysis_json("neutral", 0.5)),
        // Omits GOOG, so it must be rejected
        ("Decide BUY", decision_json(&[("AAPL", "BUY")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::new(&[]);
    let quotes = FixedQuotes::new(&[("AAPL", 100.0), ("GOOG", 140.0)]);
    let config = PipelineConfig {
        watchlist: vec!["AAPL".to_string(), "GOOG".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    assert!(report.decision.is_none());
    let error = report.decision_error.expect("validation error surfaced");
    assert!(error.contains("omits"));
    assert!(report.execution.is_none());
    assert!(broker.submitted_symbols().is_empty());

    // Nothing ambiguous reaches the store
    assert!(store
        .decision_for_snapshot(report.snapshot.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn zero_quantity_sizing_suppresses_the_order() {
    let provider = KeyedProvider::new(vec![
        ("Analyze BRKA", analysis_json("bullish", 0.9)),
        ("Decide BUY", decision_json(&[("BRKA", "BUY")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::new(&[]);
    // Price above the notional: floors to zero shares
    let quotes = FixedQuotes::new(&[("BRKA", 700_000.0)]);
    let config = PipelineConfig {
        watchlist: vec!["BRKA".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    let execution = report.execution.unwrap();
    assert!(execution.orders.is_empty());
    assert_eq!(execution.skipped.len(), 1);
    assert!(execution.skipped[0].reason.contains("zero"));
    assert!(broker.submitted_symbols().is_empty());
}

#[tokio::test]
async fn broker_failure_is_isolated_per_symbol() {
    let provider = KeyedProvider::new(vec![
        ("Analyze AAPL", analysis_json("bullish", 0.8)),
        ("Analyze GOOG", analysis_json("bullish", 0.75)),
        ("Decide BUY", decision_json(&[("AAPL", "BUY"), ("GOOG", "BUY")])),
    ]);
    let store = memory_store().await;
    let broker = MockBroker::failing_for(&[], &["AAPL"]);
    let quotes = FixedQuotes::new(&[("AAPL", 100.0), ("GOOG", 140.0)]);
    let config = PipelineConfig {
        order_submit_attempts: 2,
        watchlist: vec!["AAPL".to_string(), "GOOG".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    let execution = report.execution.unwrap();
    assert_eq!(execution.orders.len(), 1);
    assert_eq!(execution.orders[0].symbol, "GOOG");
    assert_eq!(execution.failures.len(), 1);
    assert_eq!(execution.failures[0].symbol, "AAPL");
}

#[tokio::test]
async fn holdings_and_watchlist_merge_into_one_snapshot() {
    let provider = KeyedProvider::new(vec![
        ("Analyze NVDA", analysis_json("neutral", 0.5)),
        ("Analyze AAPL", analysis_json("neutral", 0.5)),
        ("Decide BUY", decision_json(&[("NVDA", "HOLD"), ("AAPL", "HOLD")])),
    ]);
    let store = memory_store().await;
    // NVDA held at the broker and also on the watchlist: one analysis only
    let broker = MockBroker::new(&["NVDA"]);
    let quotes = FixedQuotes::new(&[("NVDA", 120.0), ("AAPL", 200.0)]);
    let config = PipelineConfig {
        watchlist: vec!["NVDA".to_string(), "AAPL".to_string()],
        ..Default::default()
    };

    let pipe = pipeline(provider, store.clone(), broker.clone(), quotes, config);
    let report = pipe.run(&[]).await.unwrap();

    assert_eq!(report.snapshot.symbols(), vec!["NVDA", "AAPL"]);
    assert_eq!(report.analyses.len(), 2);
    // All HOLD: a decision but zero orders
    assert!(report.decision.is_some());
    assert!(report.execution.unwrap().orders.is_empty());
}
