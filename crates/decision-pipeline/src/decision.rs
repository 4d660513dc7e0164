//! Portfolio Decision Stage: one reasoning-loop run over the complete
//! analysis set, validated for exact symbol coverage.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use agent_core::{
    AgentError, DecisionAction, DecisionEntry, LoopOutcome, PortfolioDecision, SymbolAnalysis,
};
use agent_store::AgentStore;
use reasoning_engine::ReasoningEngine;
use serde::Deserialize;
use uuid::Uuid;

use crate::prompts;

#[derive(Deserialize)]
struct DecisionResponse {
    decisions: Vec<DecisionResponseEntry>,
}

#[derive(Deserialize)]
struct DecisionResponseEntry {
    symbol: String,
    action: String,
    #[serde(default)]
    rationale: String,
}

pub struct DecisionStage {
    engine: Arc<ReasoningEngine>,
    store: Arc<AgentStore>,
}

impl DecisionStage {
    pub fn new(engine: Arc<ReasoningEngine>, store: Arc<AgentStore>) -> Self {
        Self { engine, store }
    }

    /// Synthesize one decision from the full analysis set of a snapshot.
    /// A decision that omits an analyzed symbol, names a foreign symbol, or
    /// duplicates a symbol is rejected and never persisted.
    pub async fn run(
        &self,
        snapshot_id: Uuid,
        analyses: &[SymbolAnalysis],
    ) -> Result<PortfolioDecision, AgentError> {
        check_snapshot_consistency(snapshot_id, analyses)?;

        let thread_id = format!("decision-{}", snapshot_id);
        let conversation = self
            .engine
            .run(
                &thread_id,
                prompts::DECISION_SYSTEM_PROMPT,
                &prompts::decision_prompt(analyses),
            )
            .await?;

        if let LoopOutcome::Aborted { reason } = &conversation.outcome {
            if let Err(e) = self
                .store
                .append_conversation(&conversation, Some(snapshot_id))
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
        let parsed: DecisionResponse = prompts::parse_json_answer(answer)?;

        let entries = validate_entries(analyses, parsed)?;
        let decision =
            PortfolioDecision::new(snapshot_id, entries, analyses, thread_id);

        self.store
            .append_decision(&decision)
            .await
            .map_err(|e| AgentError::Database(e.to_string()))?;

        tracing::info!(
            "Snapshot {}: decision {} covers {} symbols ({} actionable)",
            snapshot_id,
            decision.id,
            decision.entries.len(),
            decision
                .entries
                .iter()
                .filter(|e| e.action != DecisionAction::Hold)
                .count()
        );

        Ok(decision)
    }
}

/// One canonical analysis per symbol per snapshot, and never a mix of two
/// snapshots; duplicates are a validation error rather than a silent pick.
fn check_snapshot_consistency(
    snapshot_id: Uuid,
    analyses: &[SymbolAnalysis],
) -> Result<(), AgentError> {
    if analyses.is_empty() {
        return Err(AgentError::DecisionValidation(
            "no analyses available for this snapshot".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for analysis in analyses {
        if analysis.snapshot_id != snapshot_id {
            return Err(AgentError::DecisionValidation(format!(
                "analysis {} belongs to snapshot {}, not {}",
                analysis.id, analysis.snapshot_id, snapshot_id
            )));
        }
        if !seen.insert(analysis.symbol.clone()) {
            return Err(AgentError::DecisionValidation(format!(
                "duplicate analysis for {} in one snapshot",
                analysis.symbol
            )));
        }
    }
    Ok(())
}

/// The decision must cover exactly the analyzed symbol set.
fn validate_entries(
    analyses: &[SymbolAnalysis],
    parsed: DecisionResponse,
) -> Result<Vec<DecisionEntry>, AgentError> {
    let analyzed: BTreeSet<&str> = analyses.iter().map(|a| a.symbol.as_str()).collect();

    let mut entries = Vec::with_capacity(parsed.decisions.len());
    let mut covered = BTreeSet::new();

    for entry in parsed.decisions {
        let symbol = entry.symbol.trim().to_uppercase();
        if !analyzed.contains(symbol.as_str()) {
            return Err(AgentError::DecisionValidation(format!(
                "decision names {}, which has no analysis in this snapshot",
                symbol
            )));
        }
        if !covered.insert(symbol.clone()) {
            return Err(AgentError::DecisionValidation(format!(
                "decision lists {} more than once",
                symbol
            )));
        }
        let action = DecisionAction::parse(&entry.action).ok_or_else(|| {
            AgentError::DecisionValidation(format!(
                "unrecognized action '{}' for {}",
                entry.action, symbol
            ))
        })?;
        entries.push(DecisionEntry {
            symbol,
            action,
            rationale: entry.rationale,
        });
    }

    let missing: Vec<&str> = analyzed
        .iter()
        .filter(|s| !covered.contains(**s))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(AgentError::DecisionValidation(format!(
            "decision omits analyzed symbols: {}",
            missing.join(", ")
        )));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::AnalysisSignal;
    use chrono::Utc;

    fn analysis(snapshot_id: Uuid, symbol: &str) -> SymbolAnalysis {
        SymbolAnalysis {
            id: Uuid::new_v4(),
            snapshot_id,
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            signal: AnalysisSignal::Bullish,
            confidence: 0.7,
            support: None,
            resistance: None,
            summary: "test".to_string(),
            conversation_id: "t".to_string(),
        }
    }

    fn response(pairs: &[(&str, &str)]) -> DecisionResponse {
        DecisionResponse {
            decisions: pairs
                .iter()
                .map(|(symbol, action)| DecisionResponseEntry {
                    symbol: symbol.to_string(),
                    action: action.to_string(),
                    rationale: "because".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn exact_coverage_is_accepted() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL"), analysis(snap, "GOOG")];
        let entries =
            validate_entries(&analyses, response(&[("AAPL", "BUY"), ("GOOG", "HOLD")])).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, DecisionAction::Buy);
    }

    #[test]
    fn omitted_symbol_is_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL"), analysis(snap, "GOOG")];
        let err = validate_entries(&analyses, response(&[("AAPL", "BUY")])).unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("GOOG")));
    }

    #[test]
    fn foreign_symbol_is_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL")];
        let err =
            validate_entries(&analyses, response(&[("AAPL", "BUY"), ("TSLA", "BUY")])).unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("TSLA")));
    }

    #[test]
    fn duplicate_entry_is_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL")];
        let err = validate_entries(&analyses, response(&[("AAPL", "BUY"), ("aapl", "SELL")]))
            .unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("more than once")));
    }

    #[test]
    fn duplicate_analysis_in_one_snapshot_is_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL"), analysis(snap, "AAPL")];
        let err = check_snapshot_consistency(snap, &analyses).unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn mixed_snapshot_analyses_are_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL"), analysis(Uuid::new_v4(), "GOOG")];
        let err = check_snapshot_consistency(snap, &analyses).unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("belongs to")));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let snap = Uuid::new_v4();
        let analyses = vec![analysis(snap, "AAPL")];
        let err = validate_entries(&analyses, response(&[("AAPL", "SHORT")])).unwrap_err();
        assert!(matches!(err, AgentError::DecisionValidation(msg) if msg.contains("SHORT")));
    }
}
