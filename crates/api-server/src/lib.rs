//! HTTP surface for the agent platform: chat, pipeline runs, and the
//! history queries the dashboard's filter views rely on.

use std::sync::Arc;

use agent_store::AgentStore;
use alpaca_broker::AlpacaClient;
use alphavantage_client::AlphaVantageClient;
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use decision_pipeline::{CachedQuoteSource, Pipeline, PipelineConfig};
use llm_client::LlmClient;
use market_cache::MarketDataCache;
use reasoning_engine::{LoopConfig, ReasoningEngine};
use serde::Serialize;
use tool_registry::market_tool_registry;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod routes;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReasoningEngine>,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<AgentStore>,
}

/// Uniform response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error wrapper so handlers can use `?` on anyhow and agent errors.
pub struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("Request failed: {:#}", self.0);
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

pub async fn run_server() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting portfolio agent server");

    // Market data: Alpha Vantage behind the TTL cache
    let alphavantage_key =
        std::env::var("ALPHAVANTAGE_API_KEY").context("ALPHAVANTAGE_API_KEY not set")?;
    let market_client = Arc::new(AlphaVantageClient::new(alphavantage_key));
    let cache = Arc::new(MarketDataCache::new());

    // Tool registry + reasoning engine
    let registry = Arc::new(market_tool_registry(cache.clone(), market_client.clone()));
    let llm = Arc::new(LlmClient::from_env()?);
    let loop_config = loop_config_from_env()?;
    tracing::info!(
        "Reasoning budgets: {} tool calls, {} context chars",
        loop_config.max_iterations,
        loop_config.max_context_chars
    );
    let engine = Arc::new(ReasoningEngine::new(llm, registry, loop_config));

    // Broker, paper by default; live requires explicit approval
    let alpaca = Arc::new(AlpacaClient::from_env()?);
    if !alpaca.is_paper() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            anyhow::bail!(
                "ALPACA_BASE_URL points to live trading ({}). Set \
                 LIVE_TRADING_APPROVED=yes to enable, or use the paper endpoint.",
                alpaca.base_url()
            );
        }
        tracing::warn!("LIVE TRADING MODE — REAL MONEY AT RISK ({})", alpaca.base_url());
    } else {
        tracing::info!("Paper trading mode ({})", alpaca.base_url());
    }

    // Persistence
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:agent.db?mode=rwc".to_string());
    let store = Arc::new(AgentStore::connect(&database_url).await?);
    store.init_tables().await?;
    tracing::info!("Store ready at {}", database_url);

    // Pipeline
    let pipeline_config = PipelineConfig::from_env()?;
    tracing::info!(
        "Pipeline: {} watchlist symbols, concurrency {}, notional ${} per trade, trading {}",
        pipeline_config.watchlist.len(),
        pipeline_config.analysis_concurrency,
        pipeline_config.notional_per_trade,
        if pipeline_config.trading_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    let quotes = Arc::new(CachedQuoteSource::new(cache, market_client));
    let pipeline = Arc::new(Pipeline::new(
        engine.clone(),
        store.clone(),
        alpaca,
        quotes,
        pipeline_config,
    ));

    let state = AppState {
        engine,
        pipeline,
        store,
    };

    let app = routes::router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn loop_config_from_env() -> Result<LoopConfig> {
    let defaults = LoopConfig::default();
    Ok(LoopConfig {
        max_iterations: std::env::var("MAX_TOOL_ITERATIONS")
            .map(|v| v.parse())
            .unwrap_or(Ok(defaults.max_iterations))
            .context("MAX_TOOL_ITERATIONS must be an integer")?,
        max_context_chars: std::env::var("MAX_CONTEXT_CHARS")
            .map(|v| v.parse())
            .unwrap_or(Ok(defaults.max_context_chars))
            .context("MAX_CONTEXT_CHARS must be an integer")?,
        ..defaults
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
