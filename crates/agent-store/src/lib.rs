//! Append-only store for pipeline records. Analyses, decisions, and orders
//! are keyed by snapshot and timestamp; the history queries here are the
//! contract the dashboard's filter views rely on.

use agent_core::{
    AnalysisSignal, Conversation, OrderRecord, OrderSide, OrderStatus, PortfolioDecision,
    SymbolAnalysis,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::str::FromStr;
use uuid::Uuid;

pub struct AgentStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: String,
    snapshot_id: String,
    symbol: String,
    timestamp: String,
    signal: String,
    confidence: f64,
    support: Option<f64>,
    resistance: Option<f64>,
    summary: String,
    conversation_id: String,
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    id: String,
    snapshot_id: String,
    timestamp: String,
    entries_json: String,
    analysis_ids_json: String,
    conversation_id: String,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    decision_id: String,
    symbol: String,
    side: String,
    qty: String,
    broker_order_id: String,
    status: String,
    submitted_at: String,
}

impl AgentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .with_context(|| format!("connecting to {}", database_url))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS symbol_analyses (
                id TEXT PRIMARY KEY,
                snapshot_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                signal TEXT NOT NULL,
                confidence REAL NOT NULL,
                support REAL,
                resistance REAL,
                summary TEXT NOT NULL,
                conversation_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS portfolio_decisions (
                id TEXT PRIMARY KEY,
                snapshot_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                entries_json TEXT NOT NULL,
                analysis_ids_json TEXT NOT NULL,
                conversation_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty TEXT NOT NULL,
                broker_order_id TEXT NOT NULL,
                status TEXT NOT NULL,
                submitted_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                thread_id TEXT NOT NULL,
                snapshot_id TEXT,
                outcome TEXT NOT NULL,
                turns_json TEXT NOT NULL,
                tool_call_count INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, recorded_at)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analyses_symbol ON symbol_analyses(symbol, timestamp)",
        )
        .execute(&self.pool)
        .await
        .ok();
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analyses_snapshot ON symbol_analyses(snapshot_id)",
        )
        .execute(&self.pool)
        .await
        .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_decision ON orders(decision_id)")
            .execute(&self.pool)
            .await
            .ok();

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Appends
    // -----------------------------------------------------------------------

    pub async fn append_analysis(&self, analysis: &SymbolAnalysis) -> Result<()> {
        sqlx::query(
            "INSERT INTO symbol_analyses
             (id, snapshot_id, symbol, timestamp, signal, confidence, support, resistance, summary, conversation_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(analysis.id.to_string())
        .bind(analysis.snapshot_id.to_string())
        .bind(&analysis.symbol)
        .bind(analysis.timestamp.to_rfc3339())
        .bind(analysis.signal.as_str())
        .bind(analysis.confidence)
        .bind(analysis.support)
        .bind(analysis.resistance)
        .bind(&analysis.summary)
        .bind(&analysis.conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_decision(&self, decision: &PortfolioDecision) -> Result<()> {
        sqlx::query(
            "INSERT INTO portfolio_decisions
             (id, snapshot_id, timestamp, entries_json, analysis_ids_json, conversation_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(decision.id.to_string())
        .bind(decision.snapshot_id.to_string())
        .bind(decision.timestamp.to_rfc3339())
        .bind(serde_json::to_string(&decision.entries)?)
        .bind(serde_json::to_string(&decision.analysis_ids)?)
        .bind(&decision.conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders
             (id, decision_id, symbol, side, qty, broker_order_id, status, submitted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order.id.to_string())
        .bind(order.decision_id.to_string())
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.qty.to_string())
        .bind(&order.broker_order_id)
        .bind(order.status.as_str())
        .bind(order.submitted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fill-status refresh is the one permitted mutation on an order row.
    pub async fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(order_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a finished conversation, aborted runs included, for
    /// diagnostics.
    pub async fn append_conversation(
        &self,
        conversation: &Conversation,
        snapshot_id: Option<Uuid>,
    ) -> Result<()> {
        let outcome = match &conversation.outcome {
            agent_core::LoopOutcome::Done => "done".to_string(),
            agent_core::LoopOutcome::Aborted { reason } => format!("aborted: {}", reason),
        };
        sqlx::query(
            "INSERT INTO conversations
             (thread_id, snapshot_id, outcome, turns_json, tool_call_count, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.thread_id)
        .bind(snapshot_id.map(|id| id.to_string()))
        .bind(outcome)
        .bind(serde_json::to_string(&conversation.turns)?)
        .bind(conversation.tool_calls.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn analyses_for_snapshot(&self, snapshot_id: Uuid) -> Result<Vec<SymbolAnalysis>> {
        let rows: Vec<AnalysisRow> = sqlx::query_as(
            "SELECT id, snapshot_id, symbol, timestamp, signal, confidence, support, resistance,
                    summary, conversation_id
             FROM symbol_analyses WHERE snapshot_id = ? ORDER BY symbol",
        )
        .bind(snapshot_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(analysis_from_row).collect()
    }

    pub async fn analyses_by_symbol(
        &self,
        symbol: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SymbolAnalysis>> {
        let rows: Vec<AnalysisRow> = sqlx::query_as(
            "SELECT id, snapshot_id, symbol, timestamp, signal, confidence, support, resistance,
                    summary, conversation_id
             FROM symbol_analyses
             WHERE symbol = ?
               AND (? IS NULL OR timestamp >= ?)
               AND (? IS NULL OR timestamp <= ?)
             ORDER BY timestamp DESC",
        )
        .bind(symbol.to_uppercase())
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(analysis_from_row).collect()
    }

    pub async fn decisions(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PortfolioDecision>> {
        let rows: Vec<DecisionRow> = sqlx::query_as(
            "SELECT id, snapshot_id, timestamp, entries_json, analysis_ids_json, conversation_id
             FROM portfolio_decisions
             WHERE (? IS NULL OR timestamp >= ?)
               AND (? IS NULL OR timestamp <= ?)
             ORDER BY timestamp DESC",
        )
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decision_from_row).collect()
    }

    pub async fn decision_for_snapshot(
        &self,
        snapshot_id: Uuid,
    ) -> Result<Option<PortfolioDecision>> {
        let row: Option<DecisionRow> = sqlx::query_as(
            "SELECT id, snapshot_id, timestamp, entries_json, analysis_ids_json, conversation_id
             FROM portfolio_decisions WHERE snapshot_id = ?
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(snapshot_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decision_from_row).transpose()
    }

    pub async fn orders_for_decision(&self, decision_id: Uuid) -> Result<Vec<OrderRecord>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT id, decision_id, symbol, side, qty, broker_order_id, status, submitted_at
             FROM orders WHERE decision_id = ? ORDER BY submitted_at",
        )
        .bind(decision_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    /// Dedupe probe for idempotent re-processing of a decision.
    pub async fn order_exists(
        &self,
        decision_id: Uuid,
        symbol: &str,
        side: OrderSide,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM orders WHERE decision_id = ? AND symbol = ? AND side = ? LIMIT 1",
        )
        .bind(decision_id.to_string())
        .bind(symbol)
        .bind(side.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn orders(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrderRecord>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT id, decision_id, symbol, side, qty, broker_order_id, status, submitted_at
             FROM orders
             WHERE (? IS NULL OR submitted_at >= ?)
               AND (? IS NULL OR submitted_at <= ?)
             ORDER BY submitted_at DESC",
        )
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(from.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .bind(to.map(|t| t.to_rfc3339()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("bad uuid '{}'", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp '{}'", s))
}

fn analysis_from_row(row: AnalysisRow) -> Result<SymbolAnalysis> {
    Ok(SymbolAnalysis {
        id: parse_uuid(&row.id)?,
        snapshot_id: parse_uuid(&row.snapshot_id)?,
        symbol: row.symbol,
        timestamp: parse_timestamp(&row.timestamp)?,
        signal: AnalysisSignal::parse(&row.signal)
            .ok_or_else(|| anyhow!("bad signal '{}'", row.signal))?,
        confidence: row.confidence,
        support: row.support,
        resistance: row.resistance,
        summary: row.summary,
        conversation_id: row.conversation_id,
    })
}

fn decision_from_row(row: DecisionRow) -> Result<PortfolioDecision> {
    Ok(PortfolioDecision {
        id: parse_uuid(&row.id)?,
        snapshot_id: parse_uuid(&row.snapshot_id)?,
        timestamp: parse_timestamp(&row.timestamp)?,
        entries: serde_json::from_str(&row.entries_json)?,
        analysis_ids: serde_json::from_str(&row.analysis_ids_json)?,
        conversation_id: row.conversation_id,
    })
}

fn order_from_row(row: OrderRow) -> Result<OrderRecord> {
    let side = match row.side.as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        other => return Err(anyhow!("bad order side '{}'", other)),
    };
    Ok(OrderRecord {
        id: parse_uuid(&row.id)?,
        decision_id: parse_uuid(&row.decision_id)?,
        symbol: row.symbol,
        side,
        qty: Decimal::from_str(&row.qty).with_context(|| format!("bad qty '{}'", row.qty))?,
        broker_order_id: row.broker_order_id,
        status: OrderStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("bad order status '{}'", row.status))?,
        submitted_at: parse_timestamp(&row.submitted_at)?,
    })
}
