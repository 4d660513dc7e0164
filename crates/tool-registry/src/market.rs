//! Market analysis tools backed by the data cache and the Alpha Vantage
//! client. Quotes go through the cache's never-cache path so they are always
//! fresh; everything else honors the per-class TTL policy.

use std::sync::Arc;

use agent_core::{AgentError, Interval, NewsItem, QuoteSnapshot, ToolSchema};
use alphavantage_client::{
    AlphaVantageClient, CompanyOverview, IndicatorPoint, MacdPoint, PutCallRatio,
};
use async_trait::async_trait;
use market_cache::{DataClass, MarketDataCache};

use crate::{ToolExecutor, ToolRegistry};

/// Build the standard registry of market tools.
pub fn market_tool_registry(
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolSchema {
            name: "get_quote".to_string(),
            description: "Latest price quote for a symbol (always fresh, never cached)"
                .to_string(),
            parameters: symbol_only_schema(),
        },
        Arc::new(QuoteTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_daily_ohlcv".to_string(),
            description: "Recent OHLCV bars for a symbol at daily, weekly, or monthly granularity"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol" },
                    "interval": {
                        "type": "string",
                        "enum": ["daily", "weekly", "monthly"],
                        "description": "Bar granularity, defaults to daily"
                    }
                },
                "required": ["symbol"]
            }),
        },
        Arc::new(OhlcvTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_rsi".to_string(),
            description: "Relative Strength Index series for a symbol".to_string(),
            parameters: indicator_schema(),
        },
        Arc::new(RsiTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_sma".to_string(),
            description: "Simple Moving Average series for a symbol".to_string(),
            parameters: indicator_schema(),
        },
        Arc::new(SmaTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_macd".to_string(),
            description: "MACD series with signal line and histogram for a symbol".to_string(),
            parameters: symbol_only_schema(),
        },
        Arc::new(MacdTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_company_overview".to_string(),
            description: "Company fundamentals: valuation ratios, margins, 52-week range"
                .to_string(),
            parameters: symbol_only_schema(),
        },
        Arc::new(OverviewTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_news_sentiment".to_string(),
            description: "Recent news headlines with provider sentiment scores".to_string(),
            parameters: symbol_only_schema(),
        },
        Arc::new(NewsTool {
            cache: cache.clone(),
            client: client.clone(),
        }),
    );

    registry.register(
        ToolSchema {
            name: "get_put_call_ratio".to_string(),
            description: "Put/call volume ratio derived from the latest options chain"
                .to_string(),
            parameters: symbol_only_schema(),
        },
        Arc::new(PutCallTool { cache, client }),
    );

    registry
}

fn symbol_only_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": "Ticker symbol" }
        },
        "required": ["symbol"]
    })
}

fn indicator_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": "Ticker symbol" },
            "period": {
                "type": "integer",
                "description": "Lookback window in bars, defaults to 14"
            }
        },
        "required": ["symbol"]
    })
}

fn arg_symbol(args: &serde_json::Value) -> Result<String, AgentError> {
    args.get("symbol")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::InvalidToolArguments {
            tool: "market".to_string(),
            reason: "missing symbol".to_string(),
        })
}

fn arg_period(args: &serde_json::Value, default: u32) -> u32 {
    args.get("period")
        .and_then(|v| v.as_u64())
        .map(|p| p as u32)
        .unwrap_or(default)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, AgentError> {
    serde_json::to_value(value).map_err(|e| AgentError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

struct QuoteTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for QuoteTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(DataClass::Quote, &symbol, None, &serde_json::json!({}), || {
                let symbol = symbol.clone();
                async move { to_value(client.get_quote(&symbol).await?) }
            })
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        match serde_json::from_value::<QuoteSnapshot>(result.clone()) {
            Ok(q) => format!(
                "{} quote: ${:.2} ({:+.2}% today), volume {:.1}M, as of {}",
                q.symbol,
                q.price,
                q.change_percent,
                q.volume / 1_000_000.0,
                q.latest_trading_day
            ),
            Err(_) => "Quote unavailable".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// OHLCV bars
// ---------------------------------------------------------------------------

struct OhlcvTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for OhlcvTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let (interval, class) = match args.get("interval").and_then(|v| v.as_str()) {
            Some("weekly") => (Interval::Weekly, DataClass::WeeklyOhlcv),
            Some("monthly") => (Interval::Monthly, DataClass::MonthlyOhlcv),
            _ => (Interval::Daily, DataClass::DailyOhlcv),
        };

        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(class, &symbol, Some(interval), &serde_json::json!({}), || {
                let symbol = symbol.clone();
                async move { to_value(client.get_time_series(&symbol, interval).await?) }
            })
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        let bars: Vec<agent_core::Bar> = match serde_json::from_value(result.clone()) {
            Ok(bars) => bars,
            Err(_) => return "No bar data".to_string(),
        };
        let Some(last) = bars.last() else {
            return "No bar data".to_string();
        };
        let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let change = bars
            .first()
            .filter(|first| first.open > 0.0)
            .map(|first| (last.close - first.open) / first.open * 100.0)
            .unwrap_or(0.0);
        format!(
            "{} bars: last close {:.2} on {}, range {:.2}-{:.2}, {:+.1}% over the window",
            bars.len(),
            last.close,
            last.timestamp.format("%Y-%m-%d"),
            low,
            high,
            change
        )
    }
}

// ---------------------------------------------------------------------------
// RSI / SMA
// ---------------------------------------------------------------------------

struct RsiTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for RsiTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let period = arg_period(args, 14);
        let params = serde_json::json!({"indicator": "rsi", "period": period});

        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(
                DataClass::DerivedIndicator,
                &symbol,
                Some(Interval::Daily),
                &params,
                || {
                    let symbol = symbol.clone();
                    async move { to_value(client.get_rsi(&symbol, Interval::Daily, period).await?) }
                },
            )
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        compress_indicator(result, "RSI", |latest| {
            if latest >= 70.0 {
                " — overbought territory"
            } else if latest <= 30.0 {
                " — oversold territory"
            } else {
                ""
            }
        })
    }
}

struct SmaTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for SmaTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let period = arg_period(args, 20);
        let params = serde_json::json!({"indicator": "sma", "period": period});

        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(
                DataClass::DerivedIndicator,
                &symbol,
                Some(Interval::Daily),
                &params,
                || {
                    let symbol = symbol.clone();
                    async move { to_value(client.get_sma(&symbol, Interval::Daily, period).await?) }
                },
            )
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        compress_indicator(result, "SMA", |_| "")
    }
}

/// Latest-and-previous summary for a (timestamp, value) indicator series,
/// most recent first.
fn compress_indicator(
    result: &serde_json::Value,
    label: &str,
    note: impl Fn(f64) -> &'static str,
) -> String {
    let points: Vec<IndicatorPoint> = match serde_json::from_value(result.clone()) {
        Ok(points) => points,
        Err(_) => return format!("No {} data", label),
    };
    let Some(latest) = points.first() else {
        return format!("No {} data", label);
    };
    let trend = points
        .get(1)
        .map(|prev| {
            if latest.value > prev.value {
                format!(", rising from {:.2}", prev.value)
            } else if latest.value < prev.value {
                format!(", falling from {:.2}", prev.value)
            } else {
                ", flat".to_string()
            }
        })
        .unwrap_or_default();
    format!(
        "{} {:.2} as of {}{}{}",
        label,
        latest.value,
        latest.timestamp,
        trend,
        note(latest.value)
    )
}

// ---------------------------------------------------------------------------
// MACD
// ---------------------------------------------------------------------------

struct MacdTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for MacdTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let params = serde_json::json!({"indicator": "macd"});

        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(
                DataClass::DerivedIndicator,
                &symbol,
                Some(Interval::Daily),
                &params,
                || {
                    let symbol = symbol.clone();
                    async move { to_value(client.get_macd(&symbol, Interval::Daily).await?) }
                },
            )
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        let points: Vec<MacdPoint> = match serde_json::from_value(result.clone()) {
            Ok(points) => points,
            Err(_) => return "No MACD data".to_string(),
        };
        let Some(latest) = points.first() else {
            return "No MACD data".to_string();
        };
        let posture = if latest.macd > latest.signal {
            "bullish (MACD above signal)"
        } else {
            "bearish (MACD below signal)"
        };
        format!(
            "MACD {:.3} vs signal {:.3}, histogram {:+.3} as of {} — {}",
            latest.macd, latest.signal, latest.histogram, latest.timestamp, posture
        )
    }
}

// ---------------------------------------------------------------------------
// Fundamentals
// ---------------------------------------------------------------------------

struct OverviewTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for OverviewTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(
                DataClass::Fundamentals,
                &symbol,
                None,
                &serde_json::json!({}),
                || {
                    let symbol = symbol.clone();
                    async move { to_value(client.get_company_overview(&symbol).await?) }
                },
            )
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        let overview: CompanyOverview = match serde_json::from_value(result.clone()) {
            Ok(o) => o,
            Err(_) => return "No fundamentals data".to_string(),
        };
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "n/a".to_string());
        format!(
            "{} ({}): sector {}, P/E {}, EPS {}, margin {}, beta {}, 52w {}-{}",
            overview.name,
            overview.symbol,
            field(&overview.sector),
            field(&overview.pe_ratio),
            field(&overview.eps),
            field(&overview.profit_margin),
            field(&overview.beta),
            field(&overview.week_52_low),
            field(&overview.week_52_high),
        )
    }
}

// ---------------------------------------------------------------------------
// News sentiment
// ---------------------------------------------------------------------------

struct NewsTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for NewsTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(DataClass::News, &symbol, None, &serde_json::json!({}), || {
                let symbol = symbol.clone();
                async move { to_value(client.get_news_sentiment(&symbol, 20).await?) }
            })
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        let items: Vec<NewsItem> = match serde_json::from_value(result.clone()) {
            Ok(items) => items,
            Err(_) => return "No news data".to_string(),
        };
        if items.is_empty() {
            return "No recent news".to_string();
        }
        let avg =
            items.iter().map(|n| n.sentiment_score).sum::<f64>() / items.len() as f64;
        let mut headlines = items
            .iter()
            .take(3)
            .map(|n| n.title.chars().take(60).collect::<String>())
            .collect::<Vec<_>>()
            .join("; ");
        if headlines.is_empty() {
            headlines = "none".to_string();
        }
        format!(
            "{} articles, avg sentiment {:+.2}. Top: {}",
            items.len(),
            avg,
            headlines
        )
    }
}

// ---------------------------------------------------------------------------
// Put/call ratio
// ---------------------------------------------------------------------------

struct PutCallTool {
    cache: Arc<MarketDataCache>,
    client: Arc<AlphaVantageClient>,
}

#[async_trait]
impl ToolExecutor for PutCallTool {
    async fn execute(&self, args: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let symbol = arg_symbol(args)?;
        let client = self.client.clone();
        let lookup = self
            .cache
            .get_or_fetch(
                DataClass::OptionsAnalytics,
                &symbol,
                None,
                &serde_json::json!({}),
                || {
                    let symbol = symbol.clone();
                    async move { to_value(client.get_put_call_ratio(&symbol).await?) }
                },
            )
            .await?;
        Ok(lookup.payload)
    }

    fn compress(&self, result: &serde_json::Value) -> String {
        let pcr: PutCallRatio = match serde_json::from_value(result.clone()) {
            Ok(p) => p,
            Err(_) => return "No options data".to_string(),
        };
        let read = if pcr.ratio > 1.0 {
            "elevated put activity (bearish hedging)"
        } else if pcr.ratio < 0.7 {
            "call-heavy flow (bullish positioning)"
        } else {
            "balanced flow"
        };
        format!(
            "{} put/call ratio {:.2} (puts {:.0}, calls {:.0}) — {}",
            pcr.symbol, pcr.ratio, pcr.put_volume, pcr.call_volume, read
        )
    }
}
