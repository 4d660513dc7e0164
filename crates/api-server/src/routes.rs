use agent_core::{LoopOutcome, OrderRecord, PortfolioDecision, SymbolAnalysis};
use anyhow::{anyhow, Context};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use decision_pipeline::prompts::CHAT_SYSTEM_PROMPT;
use reasoning_engine::ThreadStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiResponse, AppError, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/pipeline/run", post(run_pipeline))
        .route("/api/analyses", get(list_analyses))
        .route("/api/decisions", get(list_decisions))
        .route("/api/orders", get(list_orders))
}

async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("ok"))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatRequest {
    /// Omit to start a new thread
    thread_id: Option<String>,
    message: String,
}

#[derive(Serialize)]
struct ChatReply {
    thread_id: String,
    answer: Option<String>,
    outcome: String,
    tool_calls: usize,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ApiResponse<ChatReply>>, AppError> {
    let thread_id = req
        .thread_id
        .unwrap_or_else(ThreadStore::new_thread_id);

    let conversation = state
        .engine
        .run(&thread_id, CHAT_SYSTEM_PROMPT, &req.message)
        .await
        .map_err(|e| anyhow!(e))?;

    let outcome = match &conversation.outcome {
        LoopOutcome::Done => "done".to_string(),
        LoopOutcome::Aborted { reason } => {
            // Keep aborted chats queryable for diagnostics
            state
                .store
                .append_conversation(&conversation, None)
                .await
                .ok();
            format!("aborted: {}", reason)
        }
    };

    Ok(Json(ApiResponse::success(ChatReply {
        thread_id,
        answer: conversation.final_answer,
        outcome,
        tool_calls: conversation.tool_calls.len(),
    })))
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct RunPipelineRequest {
    #[serde(default)]
    watchlist: Vec<String>,
}

#[derive(Serialize)]
struct PipelineReply {
    snapshot_id: Uuid,
    symbols: Vec<String>,
    analyses: Vec<SymbolAnalysis>,
    failed_symbols: Vec<FailedSymbol>,
    decision: Option<PortfolioDecision>,
    decision_error: Option<String>,
    orders: Vec<OrderRecord>,
    skipped_orders: Vec<FailedSymbol>,
    failed_orders: Vec<FailedSymbol>,
}

#[derive(Serialize)]
struct FailedSymbol {
    symbol: String,
    reason: String,
}

async fn run_pipeline(
    State(state): State<AppState>,
    payload: Option<Json<RunPipelineRequest>>,
) -> Result<Json<ApiResponse<PipelineReply>>, AppError> {
    let Json(req) = payload.unwrap_or_else(|| Json(RunPipelineRequest::default()));
    let report = state
        .pipeline
        .run(&req.watchlist)
        .await
        .map_err(|e| anyhow!(e))?;

    let (orders, skipped_orders, failed_orders) = match report.execution {
        Some(execution) => (
            execution.orders,
            execution
                .skipped
                .into_iter()
                .map(|s| FailedSymbol {
                    symbol: s.symbol,
                    reason: s.reason,
                })
                .collect(),
            execution
                .failures
                .into_iter()
                .map(|s| FailedSymbol {
                    symbol: s.symbol,
                    reason: s.reason,
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new(), Vec::new()),
    };

    Ok(Json(ApiResponse::success(PipelineReply {
        snapshot_id: report.snapshot.id,
        symbols: report.snapshot.symbols(),
        analyses: report.analyses,
        failed_symbols: report
            .failures
            .into_iter()
            .map(|f| FailedSymbol {
                symbol: f.symbol,
                reason: f.error,
            })
            .collect(),
        decision: report.decision,
        decision_error: report.decision_error,
        orders,
        skipped_orders,
        failed_orders,
    })))
}

// ---------------------------------------------------------------------------
// History queries
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnalysesQuery {
    symbol: String,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize, Default)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize, Default)]
struct OrdersQuery {
    decision_id: Option<Uuid>,
    from: Option<String>,
    to: Option<String>,
}

fn parse_time(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("{} must be an RFC 3339 timestamp", name))
        })
        .transpose()
        .map_err(AppError::from)
}

async fn list_analyses(
    State(state): State<AppState>,
    Query(query): Query<AnalysesQuery>,
) -> Result<Json<ApiResponse<Vec<SymbolAnalysis>>>, AppError> {
    let from = parse_time(query.from.as_deref(), "from")?;
    let to = parse_time(query.to.as_deref(), "to")?;
    let analyses = state
        .store
        .analyses_by_symbol(&query.symbol, from, to)
        .await?;
    Ok(Json(ApiResponse::success(analyses)))
}

async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<ApiResponse<Vec<PortfolioDecision>>>, AppError> {
    let from = parse_time(query.from.as_deref(), "from")?;
    let to = parse_time(query.to.as_deref(), "to")?;
    let decisions = state.store.decisions(from, to).await?;
    Ok(Json(ApiResponse::success(decisions)))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<ApiResponse<Vec<OrderRecord>>>, AppError> {
    let orders = match query.decision_id {
        Some(decision_id) => state.store.orders_for_decision(decision_id).await?,
        None => {
            let from = parse_time(query.from.as_deref(), "from")?;
            let to = parse_time(query.to.as_deref(), "to")?;
            state.store.orders(from, to).await?
        }
    };
    Ok(Json(ApiResponse::success(orders)))
}
