//! The analysis → decision → order pipeline over one portfolio snapshot.
//!
//! Stage ordering is strict: the decision stage starts only after every
//! per-symbol analysis has reached a terminal state, and the execution
//! stage starts only after a validated decision exists.

use std::sync::Arc;

use agent_core::{AgentError, PortfolioSnapshot, SymbolAnalysis};
use agent_store::AgentStore;
use anyhow::{Context, Result};
use broker_trait::BrokerClient;
use reasoning_engine::ReasoningEngine;
use rust_decimal::Decimal;

pub mod analysis;
pub mod decision;
pub mod execution;
pub mod prompts;

pub use analysis::{AnalysisStage, AnalysisStageReport, SymbolFailure};
pub use decision::DecisionStage;
pub use execution::{
    CachedQuoteSource, ExecutionConfig, ExecutionReport, ExecutionStage, QuoteSource,
    SkippedEntry,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded fan-out across per-symbol conversations
    pub analysis_concurrency: usize,
    /// Dollar notional per trade for order sizing
    pub notional_per_trade: Decimal,
    /// Attempts per order submission
    pub order_submit_attempts: u32,
    /// When false, decisions are produced but never executed
    pub trading_enabled: bool,
    /// Symbols tracked in addition to broker holdings
    pub watchlist: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_concurrency: 3,
            notional_per_trade: Decimal::new(1000, 0),
            order_submit_attempts: 3,
            trading_enabled: true,
            watchlist: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            analysis_concurrency: std::env::var("ANALYSIS_CONCURRENCY")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("ANALYSIS_CONCURRENCY must be an integer")?,
            notional_per_trade: std::env::var("NOTIONAL_PER_TRADE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("NOTIONAL_PER_TRADE must be a decimal")?,
            order_submit_attempts: std::env::var("ORDER_SUBMIT_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("ORDER_SUBMIT_ATTEMPTS must be an integer")?,
            trading_enabled: std::env::var("TRADING_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("TRADING_ENABLED must be true or false")?,
            watchlist: std::env::var("WATCHLIST")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

/// Outcome of one full pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    pub snapshot: PortfolioSnapshot,
    pub analyses: Vec<SymbolAnalysis>,
    pub failures: Vec<SymbolFailure>,
    pub decision: Option<agent_core::PortfolioDecision>,
    /// Decision-stage failure, isolated so analysis results still surface
    pub decision_error: Option<String>,
    pub execution: Option<ExecutionReport>,
}

pub struct Pipeline {
    analysis: AnalysisStage,
    decision: DecisionStage,
    execution: ExecutionStage,
    broker: Arc<dyn BrokerClient>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        engine: Arc<ReasoningEngine>,
        store: Arc<AgentStore>,
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<dyn QuoteSource>,
        config: PipelineConfig,
    ) -> Self {
        let execution_config = ExecutionConfig {
            notional_per_trade: config.notional_per_trade,
            submit_attempts: config.order_submit_attempts,
        };
        Self {
            analysis: AnalysisStage::new(
                engine.clone(),
                store.clone(),
                config.analysis_concurrency,
            ),
            decision: DecisionStage::new(engine, store.clone()),
            execution: ExecutionStage::new(broker.clone(), quotes, store, execution_config),
            broker,
            config,
        }
    }

    /// Snapshot = current broker holdings plus the configured watchlist.
    pub async fn build_snapshot(
        &self,
        extra_watchlist: &[String],
    ) -> Result<PortfolioSnapshot, AgentError> {
        let positions = self
            .broker
            .get_positions()
            .await
            .map_err(|e| AgentError::Broker(e.to_string()))?;
        let holdings = positions.into_iter().map(|p| p.symbol).collect();

        let mut watchlist = self.config.watchlist.clone();
        watchlist.extend(extra_watchlist.iter().cloned());

        Ok(PortfolioSnapshot::new(holdings, watchlist))
    }

    /// Run the full pipeline for a fresh snapshot. Analysis failures and a
    /// failed decision are reported, not propagated, so partial results
    /// always reach the caller; stage ordering is preserved throughout.
    pub async fn run(&self, extra_watchlist: &[String]) -> Result<PipelineReport, AgentError> {
        let snapshot = self.build_snapshot(extra_watchlist).await?;
        tracing::info!(
            "Pipeline run for snapshot {} ({} symbols)",
            snapshot.id,
            snapshot.symbols().len()
        );

        let analysis_report = self.analysis.run(&snapshot).await;

        let mut report = PipelineReport {
            snapshot,
            analyses: analysis_report.analyses,
            failures: analysis_report.failures,
            decision: None,
            decision_error: None,
            execution: None,
        };

        if report.analyses.is_empty() {
            report.decision_error = Some("no successful analyses for this snapshot".to_string());
            return Ok(report);
        }

        match self
            .decision
            .run(report.snapshot.id, &report.analyses)
            .await
        {
            Ok(decision) => {
                if self.config.trading_enabled {
                    report.execution = Some(self.execution.run(&decision).await);
                } else {
                    tracing::info!(
                        "Trading disabled; decision {} recorded without orders",
                        decision.id
                    );
                }
                report.decision = Some(decision);
            }
            Err(e) => {
                tracing::warn!(
                    "Snapshot {}: decision stage failed: {}",
                    report.snapshot.id,
                    e
                );
                report.decision_error = Some(e.to_string());
            }
        }

        Ok(report)
    }

    pub fn execution_stage(&self) -> &ExecutionStage {
        &self.execution
    }
}

#[cfg(test)]
mod tests;
