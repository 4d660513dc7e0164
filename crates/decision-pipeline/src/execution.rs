//! Order Execution Stage: turns non-HOLD decision entries into broker
//! orders, idempotently and with per-symbol failure isolation.

use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    AgentError, DecisionAction, OrderRecord, OrderSide, OrderStatus, PortfolioDecision,
};
use agent_store::AgentStore;
use async_trait::async_trait;
use broker_trait::{BrokerClient, BrokerOrderRequest, BrokerOrderSide, BrokerOrderStatus};
use chrono::Utc;
use market_cache::{DataClass, MarketDataCache};
use rust_decimal::prelude::*;
use uuid::Uuid;

/// Source of the live price used for order sizing. Quotes go through the
/// market cache's never-cache path, so every read is fresh.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<f64, AgentError>;
}

pub struct CachedQuoteSource {
    cache: Arc<MarketDataCache>,
    client: Arc<alphavantage_client::AlphaVantageClient>,
}

impl CachedQuoteSource {
    pub fn new(
        cache: Arc<MarketDataCache>,
        client: Arc<alphavantage_client::AlphaVantageClient>,
    ) -> Self {
        Self { cache, client }
    }
}

#[async_trait]
impl QuoteSource for CachedQuoteSource {
    async fn latest_price(&self, symbol: &str) -> Result<f64, AgentError> {
        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(DataClass::Quote, symbol, None, &serde_json::json!({}), || {
                let symbol = symbol.to_string();
                async move {
                    let quote = client.get_quote(&symbol).await?;
                    serde_json::to_value(quote).map_err(|e| AgentError::Parse(e.to_string()))
                }
            })
            .await?;
        lookup
            .payload
            .get("price")
            .and_then(|v| v.as_f64())
            .filter(|p| *p > 0.0)
            .ok_or_else(|| AgentError::MarketData(format!("no usable price for {}", symbol)))
    }
}

enum EntryOutcome {
    Placed(OrderRecord),
    AlreadyOrdered,
    SuppressedZeroQty { price: f64 },
}

fn unified_status(status: BrokerOrderStatus) -> OrderStatus {
    match status {
        BrokerOrderStatus::Filled => OrderStatus::Filled,
        BrokerOrderStatus::Rejected => OrderStatus::Rejected,
        BrokerOrderStatus::Cancelled => OrderStatus::Cancelled,
        BrokerOrderStatus::Submitted => OrderStatus::Submitted,
    }
}

/// An entry that produced no order, with the reason
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub orders: Vec<OrderRecord>,
    pub skipped: Vec<SkippedEntry>,
    pub failures: Vec<SkippedEntry>,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Dollar notional per trade; sizing floors to whole shares
    pub notional_per_trade: Decimal,
    /// Attempts per order submission (transient failures are retryable)
    pub submit_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            notional_per_trade: Decimal::new(1000, 0),
            submit_attempts: 3,
        }
    }
}

pub struct ExecutionStage {
    broker: Arc<dyn BrokerClient>,
    quotes: Arc<dyn QuoteSource>,
    store: Arc<AgentStore>,
    config: ExecutionConfig,
}

impl ExecutionStage {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<dyn QuoteSource>,
        store: Arc<AgentStore>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            broker,
            quotes,
            store,
            config,
        }
    }

    /// Submit one order per non-HOLD entry of a validated decision.
    /// Re-processing the same decision never duplicates orders (dedupe by
    /// decision id + symbol + side); failures are isolated per symbol.
    pub async fn run(&self, decision: &PortfolioDecision) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for entry in &decision.entries {
            let side = match entry.action {
                DecisionAction::Hold => continue,
                DecisionAction::Buy => OrderSide::Buy,
                DecisionAction::Sell => OrderSide::Sell,
            };

            match self.execute_entry(decision, &entry.symbol, side).await {
                Ok(EntryOutcome::Placed(order)) => report.orders.push(order),
                Ok(EntryOutcome::AlreadyOrdered) => report.skipped.push(SkippedEntry {
                    symbol: entry.symbol.clone(),
                    reason: "already ordered for this decision".to_string(),
                }),
                Ok(EntryOutcome::SuppressedZeroQty { price }) => {
                    report.skipped.push(SkippedEntry {
                        symbol: entry.symbol.clone(),
                        reason: format!("sized to zero shares at price {:.2}", price),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Decision {}: order for {} failed: {}",
                        decision.id,
                        entry.symbol,
                        e
                    );
                    report.failures.push(SkippedEntry {
                        symbol: entry.symbol.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Decision {}: {} orders placed, {} skipped, {} failed",
            decision.id,
            report.orders.len(),
            report.skipped.len(),
            report.failures.len()
        );
        report
    }

    async fn execute_entry(
        &self,
        decision: &PortfolioDecision,
        symbol: &str,
        side: OrderSide,
    ) -> Result<EntryOutcome, AgentError> {
        let exists = self
            .store
            .order_exists(decision.id, symbol, side)
            .await
            .map_err(|e| AgentError::Database(e.to_string()))?;
        if exists {
            tracing::info!(
                "Decision {}: {} {} already ordered, skipping",
                decision.id,
                side,
                symbol
            );
            return Ok(EntryOutcome::AlreadyOrdered);
        }

        let price = self.quotes.latest_price(symbol).await?;
        let Some(qty) = self.size_order(symbol, price)? else {
            return Ok(EntryOutcome::SuppressedZeroQty { price });
        };

        let broker_side = match side {
            OrderSide::Buy => BrokerOrderSide::Buy,
            OrderSide::Sell => BrokerOrderSide::Sell,
        };
        let broker_order = self
            .submit_with_retry(BrokerOrderRequest {
                symbol: symbol.to_string(),
                qty,
                side: broker_side,
            })
            .await?;

        // The order must post-date its decision even on sub-millisecond runs.
        let mut submitted_at = Utc::now();
        if submitted_at <= decision.timestamp {
            submitted_at = decision.timestamp + chrono::Duration::milliseconds(1);
        }

        let record = OrderRecord {
            id: Uuid::new_v4(),
            decision_id: decision.id,
            symbol: symbol.to_string(),
            side,
            qty,
            broker_order_id: broker_order.id,
            status: unified_status(broker_order.status),
            submitted_at,
        };

        self.store
            .append_order(&record)
            .await
            .map_err(|e| AgentError::Database(e.to_string()))?;

        Ok(EntryOutcome::Placed(record))
    }

    /// Whole-share sizing from the configured notional; None means the
    /// entry is explicitly suppressed (zero-quantity).
    fn size_order(&self, symbol: &str, price: f64) -> Result<Option<Decimal>, AgentError> {
        let price = Decimal::from_f64(price)
            .filter(|p| p.is_sign_positive() && !p.is_zero())
            .ok_or_else(|| AgentError::OrderSubmission {
                symbol: symbol.to_string(),
                reason: format!("unusable price {}", price),
            })?;
        let shares = (self.config.notional_per_trade / price).floor();
        if shares.is_zero() {
            return Ok(None);
        }
        Ok(Some(shares))
    }

    async fn submit_with_retry(
        &self,
        request: BrokerOrderRequest,
    ) -> Result<broker_trait::BrokerOrder, AgentError> {
        let mut last_error = None;
        for attempt in 1..=self.config.submit_attempts {
            match self.broker.submit_market_order(request.clone()).await {
                Ok(order) => return Ok(order),
                Err(e) => {
                    tracing::warn!(
                        "Order submit attempt {}/{} for {} failed: {}",
                        attempt,
                        self.config.submit_attempts,
                        request.symbol,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.config.submit_attempts {
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(AgentError::OrderSubmission {
            symbol: request.symbol,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Refresh the stored status of an order from the broker.
    pub async fn refresh_order_status(&self, record: &OrderRecord) -> Result<OrderStatus, AgentError> {
        let broker_order = self
            .broker
            .get_order(&record.broker_order_id)
            .await
            .map_err(|e| AgentError::Broker(e.to_string()))?;
        let status = unified_status(broker_order.status);
        if status != record.status {
            self.store
                .update_order_status(record.id, status)
                .await
                .map_err(|e| AgentError::Database(e.to_string()))?;
        }
        Ok(status)
    }
}
