//! Individual Analysis Stage: one reasoning-loop run per tracked symbol.

use std::sync::Arc;

use agent_core::{AgentError, AnalysisSignal, LoopOutcome, PortfolioSnapshot, SymbolAnalysis};
use agent_store::AgentStore;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reasoning_engine::ReasoningEngine;
use serde::Deserialize;
use uuid::Uuid;

use crate::prompts;

/// A symbol whose analysis failed, flagged without aborting the batch
#[derive(Debug, Clone)]
pub struct SymbolFailure {
    pub symbol: String,
    pub error: String,
}

/// Partial result set of one analysis run
#[derive(Debug, Default)]
pub struct AnalysisStageReport {
    pub analyses: Vec<SymbolAnalysis>,
    pub failures: Vec<SymbolFailure>,
}

#[derive(Deserialize)]
struct AnalysisResponse {
    signal: String,
    confidence: f64,
    #[serde(default)]
    support: Option<f64>,
    #[serde(default)]
    resistance: Option<f64>,
    summary: String,
}

pub struct AnalysisStage {
    engine: Arc<ReasoningEngine>,
    store: Arc<AgentStore>,
    concurrency: usize,
}

impl AnalysisStage {
    pub fn new(engine: Arc<ReasoningEngine>, store: Arc<AgentStore>, concurrency: usize) -> Self {
        Self {
            engine,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Analyze every distinct symbol of the snapshot with bounded
    /// concurrency. Each symbol gets a self-contained conversation; a
    /// failure on one symbol never aborts the others.
    pub async fn run(&self, snapshot: &PortfolioSnapshot) -> AnalysisStageReport {
        let symbols = snapshot.symbols();
        tracing::info!(
            "Snapshot {}: analyzing {} symbols (concurrency {})",
            snapshot.id,
            symbols.len(),
            self.concurrency
        );

        let results: Vec<(String, Result<SymbolAnalysis, AgentError>)> = stream::iter(symbols)
            .map(|symbol| async move {
                let result = self.analyze_symbol(snapshot, &symbol).await;
                (symbol, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = AnalysisStageReport::default();
        for (symbol, result) in results {
            match result {
                Ok(analysis) => report.analyses.push(analysis),
                Err(e) => {
                    tracing::warn!(
                        "Snapshot {}: analysis of {} failed: {}",
                        snapshot.id,
                        symbol,
                        e
                    );
                    report.failures.push(SymbolFailure {
                        symbol,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.analyses.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        tracing::info!(
            "Snapshot {}: {} analyses complete, {} failed",
            snapshot.id,
            report.analyses.len(),
            report.failures.len()
        );
        report
    }

    async fn analyze_symbol(
        &self,
        snapshot: &PortfolioSnapshot,
        symbol: &str,
    ) -> Result<SymbolAnalysis, AgentError> {
        let thread_id = format!("analysis-{}-{}", snapshot.id, symbol);
        let conversation = self
            .engine
            .run(
                &thread_id,
                prompts::ANALYSIS_SYSTEM_PROMPT,
                &prompts::analysis_prompt(symbol),
            )
            .await?;

        if let LoopOutcome::Aborted { reason } = &conversation.outcome {
            // Keep the partial conversation for diagnostics; emit no record.
            if let Err(e) = self
                .store
                .append_conversation(&conversation, Some(snapshot.id))
                .await
            {
                tracing::warn!("Failed to record aborted conversation: {}", e);
            }
            return Err(AgentError::LoopAborted {
                reason: reason.clone(),
            });
        }

        let answer = conversation
            .final_answer
            .as_deref()
            .ok_or_else(|| AgentError::Parse("conversation ended without an answer".to_string()))?;
        let parsed: AnalysisResponse = prompts::parse_json_answer(answer)?;

        let signal = AnalysisSignal::parse(&parsed.signal).ok_or_else(|| {
            AgentError::Parse(format!("unrecognized signal '{}'", parsed.signal))
        })?;

        let analysis = SymbolAnalysis {
            id: Uuid::new_v4(),
            snapshot_id: snapshot.id,
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            signal,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            support: parsed.support,
            resistance: parsed.resistance,
            summary: parsed.summary,
            conversation_id: thread_id,
        };

        self.store
            .append_analysis(&analysis)
            .await
            .map_err(|e| AgentError::Database(e.to_string()))?;

        Ok(analysis)
    }
}
