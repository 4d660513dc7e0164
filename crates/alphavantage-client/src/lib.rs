use agent_core::{AgentError, Bar, Interval, NewsItem, QuoteSnapshot};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://www.alphavantage.co/query";

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            let wait_until = ts.front().unwrap().checked_add(self.window).unwrap();
            let sleep_dur = wait_until.duration_since(now) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!(
                "Rate limiter: waiting {:.1}s for Alpha Vantage slot",
                sleep_dur.as_secs_f64()
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// One (timestamp, value) point of an indicator series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub timestamp: String,
    pub value: f64,
}

/// One MACD observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdPoint {
    pub timestamp: String,
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Company fundamentals from the OVERVIEW endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyOverview {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Sector", default)]
    pub sector: Option<String>,
    #[serde(rename = "MarketCapitalization", default)]
    pub market_cap: Option<String>,
    #[serde(rename = "PERatio", default)]
    pub pe_ratio: Option<String>,
    #[serde(rename = "PEGRatio", default)]
    pub peg_ratio: Option<String>,
    #[serde(rename = "DividendYield", default)]
    pub dividend_yield: Option<String>,
    #[serde(rename = "EPS", default)]
    pub eps: Option<String>,
    #[serde(rename = "ReturnOnEquityTTM", default)]
    pub roe: Option<String>,
    #[serde(rename = "ProfitMargin", default)]
    pub profit_margin: Option<String>,
    #[serde(rename = "Beta", default)]
    pub beta: Option<String>,
    #[serde(rename = "52WeekHigh", default)]
    pub week_52_high: Option<String>,
    #[serde(rename = "52WeekLow", default)]
    pub week_52_low: Option<String>,
}

/// Aggregate put/call volume reading derived from the options chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCallRatio {
    pub symbol: String,
    pub put_volume: f64,
    pub call_volume: f64,
    pub ratio: f64,
}

#[derive(Clone)]
pub struct AlphaVantageClient {
    api_key: String,
    client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl AlphaVantageClient {
    pub fn new(api_key: String) -> Self {
        // Premium plans allow 75 req/min; free tier users should set
        // ALPHAVANTAGE_RATE_LIMIT=5.
        let rate_limit: usize = std::env::var("ALPHAVANTAGE_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(75);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_key,
            client,
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(60)),
        }
    }

    /// GET with rate limiting and automatic retry on provider throttle notes.
    /// Alpha Vantage signals throttling with HTTP 200 plus a "Note" body.
    async fn get_json(&self, params: &[(&str, &str)]) -> Result<serde_json::Value, AgentError> {
        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;

            let response = self
                .client
                .get(BASE_URL)
                .query(params)
                .query(&[("apikey", self.api_key.as_str())])
                .send()
                .await
                .map_err(|e| AgentError::MarketData(e.to_string()))?;

            if !response.status().is_success() {
                return Err(AgentError::MarketData(format!(
                    "HTTP {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                )));
            }

            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| AgentError::MarketData(e.to_string()))?;

            if let Some(error) = json.get("Error Message") {
                return Err(AgentError::MarketData(format!(
                    "Alpha Vantage error: {}",
                    error
                )));
            }

            if json.get("Note").is_some() || json.get("Information").is_some() {
                let wait_secs = 15u64;
                tracing::warn!(
                    "Alpha Vantage throttled, waiting {}s before retry {}/3",
                    wait_secs,
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }

            return Ok(json);
        }

        Err(AgentError::MarketData(
            "Rate limited by Alpha Vantage after 3 retries".to_string(),
        ))
    }

    /// Get OHLCV bars for a symbol at the given interval
    pub async fn get_time_series(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Vec<Bar>, AgentError> {
        let json = match interval {
            Interval::Daily => {
                self.get_json(&[
                    ("function", "TIME_SERIES_DAILY"),
                    ("symbol", symbol),
                    ("outputsize", "compact"),
                ])
                .await?
            }
            Interval::Weekly => {
                self.get_json(&[("function", "TIME_SERIES_WEEKLY"), ("symbol", symbol)])
                    .await?
            }
            Interval::Monthly => {
                self.get_json(&[("function", "TIME_SERIES_MONTHLY"), ("symbol", symbol)])
                    .await?
            }
            intraday => {
                self.get_json(&[
                    ("function", "TIME_SERIES_INTRADAY"),
                    ("symbol", symbol),
                    ("interval", intraday.as_str()),
                    ("outputsize", "compact"),
                ])
                .await?
            }
        };

        let series_key = json
            .as_object()
            .and_then(|obj| obj.keys().find(|k| k.contains("Time Series")).cloned())
            .ok_or_else(|| AgentError::MarketData(format!("No time series for {}", symbol)))?;

        let series = json
            .get(&series_key)
            .and_then(|v| v.as_object())
            .ok_or_else(|| AgentError::MarketData("Malformed time series payload".to_string()))?;

        let mut bars = Vec::with_capacity(series.len());
        for (stamp, fields) in series {
            let parse = |key: &str| {
                fields
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
            };
            let (Some(open), Some(high), Some(low), Some(close)) = (
                parse("1. open"),
                parse("2. high"),
                parse("3. low"),
                parse("4. close"),
            ) else {
                continue;
            };
            let volume = parse("5. volume").unwrap_or(0.0);
            bars.push(Bar {
                timestamp: parse_timestamp(stamp)?,
                open,
                high,
                low,
                close,
                volume,
            });
        }

        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    /// Get the latest quote (GLOBAL_QUOTE), always a fresh read
    pub async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, AgentError> {
        let json = self
            .get_json(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol)])
            .await?;

        let quote = json
            .get("Global Quote")
            .and_then(|v| v.as_object())
            .ok_or_else(|| AgentError::MarketData(format!("No quote for {}", symbol)))?;

        let field = |key: &str| quote.get(key).and_then(|v| v.as_str()).unwrap_or_default();
        let num = |key: &str| field(key).parse::<f64>().unwrap_or(0.0);

        let price = num("05. price");
        if price <= 0.0 {
            return Err(AgentError::MarketData(format!(
                "Quote for {} has no price",
                symbol
            )));
        }

        Ok(QuoteSnapshot {
            symbol: field("01. symbol").to_string(),
            price,
            change_percent: field("10. change percent")
                .trim_end_matches('%')
                .parse()
                .unwrap_or(0.0),
            volume: num("06. volume"),
            latest_trading_day: field("07. latest trading day").to_string(),
        })
    }

    /// Get RSI series for a symbol
    pub async fn get_rsi(
        &self,
        symbol: &str,
        interval: Interval,
        time_period: u32,
    ) -> Result<Vec<IndicatorPoint>, AgentError> {
        let period = time_period.to_string();
        let json = self
            .get_json(&[
                ("function", "RSI"),
                ("symbol", symbol),
                ("interval", interval.as_str()),
                ("time_period", &period),
                ("series_type", "close"),
            ])
            .await?;
        parse_indicator_series(&json, "Technical Analysis: RSI", "RSI")
    }

    /// Get SMA series for a symbol
    pub async fn get_sma(
        &self,
        symbol: &str,
        interval: Interval,
        time_period: u32,
    ) -> Result<Vec<IndicatorPoint>, AgentError> {
        let period = time_period.to_string();
        let json = self
            .get_json(&[
                ("function", "SMA"),
                ("symbol", symbol),
                ("interval", interval.as_str()),
                ("time_period", &period),
                ("series_type", "close"),
            ])
            .await?;
        parse_indicator_series(&json, "Technical Analysis: SMA", "SMA")
    }

    /// Get MACD series for a symbol
    pub async fn get_macd(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Vec<MacdPoint>, AgentError> {
        let json = self
            .get_json(&[
                ("function", "MACD"),
                ("symbol", symbol),
                ("interval", interval.as_str()),
                ("series_type", "close"),
            ])
            .await?;

        let series = json
            .get("Technical Analysis: MACD")
            .and_then(|v| v.as_object())
            .ok_or_else(|| AgentError::MarketData(format!("No MACD data for {}", symbol)))?;

        let mut data = Vec::new();
        for (timestamp, values) in series {
            let num = |key: &str| {
                values
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
            };
            if let (Some(macd), Some(signal), Some(histogram)) =
                (num("MACD"), num("MACD_Signal"), num("MACD_Hist"))
            {
                data.push(MacdPoint {
                    timestamp: timestamp.clone(),
                    macd,
                    signal,
                    histogram,
                });
            }
        }

        data.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(data)
    }

    /// Get company fundamentals overview
    pub async fn get_company_overview(&self, symbol: &str) -> Result<CompanyOverview, AgentError> {
        let json = self
            .get_json(&[("function", "OVERVIEW"), ("symbol", symbol)])
            .await?;

        if json.get("Symbol").is_none() {
            return Err(AgentError::MarketData(format!(
                "No overview data for {}",
                symbol
            )));
        }

        serde_json::from_value(json).map_err(|e| AgentError::MarketData(e.to_string()))
    }

    /// Get recent news with provider sentiment scores
    pub async fn get_news_sentiment(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<NewsItem>, AgentError> {
        let json = self
            .get_json(&[("function", "NEWS_SENTIMENT"), ("tickers", symbol)])
            .await?;

        let feed = json
            .get("feed")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AgentError::MarketData(format!("No news feed for {}", symbol)))?;

        let items = feed
            .iter()
            .take(limit)
            .map(|item| {
                let text = |key: &str| {
                    item.get(key)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                NewsItem {
                    title: text("title"),
                    source: text("source"),
                    published_at: text("time_published"),
                    sentiment_score: item
                        .get("overall_sentiment_score")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                    sentiment_label: text("overall_sentiment_label"),
                }
            })
            .collect();

        Ok(items)
    }

    /// Derive the put/call volume ratio from the latest options chain
    pub async fn get_put_call_ratio(&self, symbol: &str) -> Result<PutCallRatio, AgentError> {
        let json = self
            .get_json(&[("function", "HISTORICAL_OPTIONS"), ("symbol", symbol)])
            .await?;

        let contracts = json
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AgentError::MarketData(format!("No options data for {}", symbol)))?;

        let mut put_volume = 0.0;
        let mut call_volume = 0.0;
        for contract in contracts {
            let volume = contract
                .get("volume")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            match contract.get("type").and_then(|v| v.as_str()) {
                Some("put") => put_volume += volume,
                Some("call") => call_volume += volume,
                _ => {}
            }
        }

        let ratio = if call_volume > 0.0 {
            put_volume / call_volume
        } else {
            0.0
        };

        Ok(PutCallRatio {
            symbol: symbol.to_uppercase(),
            put_volume,
            call_volume,
            ratio,
        })
    }
}

fn parse_indicator_series(
    json: &serde_json::Value,
    series_key: &str,
    value_key: &str,
) -> Result<Vec<IndicatorPoint>, AgentError> {
    let series = json
        .get(series_key)
        .and_then(|v| v.as_object())
        .ok_or_else(|| AgentError::MarketData(format!("Missing '{}' payload", series_key)))?;

    let mut data = Vec::new();
    for (timestamp, values) in series {
        if let Some(value) = values
            .get(value_key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
        {
            data.push(IndicatorPoint {
                timestamp: timestamp.clone(),
                value,
            });
        }
    }

    // Most recent first
    data.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(data)
}

/// Alpha Vantage stamps daily series as dates and intraday series as
/// date-times; accept both.
fn parse_timestamp(stamp: &str) -> Result<DateTime<Utc>, AgentError> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&dt));
    }
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d")
        .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()))
        .map_err(|e| AgentError::MarketData(format!("Bad timestamp '{}': {}", stamp, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_and_datetime_stamps() {
        let daily = parse_timestamp("2025-06-02").unwrap();
        assert_eq!(daily.format("%Y-%m-%d %H:%M").to_string(), "2025-06-02 00:00");

        let intraday = parse_timestamp("2025-06-02 15:30:00").unwrap();
        assert_eq!(intraday.format("%H:%M").to_string(), "15:30");

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn indicator_series_sorted_most_recent_first() {
        let json = serde_json::json!({
            "Technical Analysis: RSI": {
                "2025-06-01": { "RSI": "45.1" },
                "2025-06-03": { "RSI": "55.9" },
                "2025-06-02": { "RSI": "not-a-number" },
            }
        });
        let points = parse_indicator_series(&json, "Technical Analysis: RSI", "RSI").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, "2025-06-03");
        assert!((points[0].value - 55.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    #[ignore] // Only run with a valid ALPHAVANTAGE_API_KEY
    async fn live_quote_roundtrip() {
        let key = std::env::var("ALPHAVANTAGE_API_KEY").unwrap();
        let client = AlphaVantageClient::new(key);
        let quote = client.get_quote("AAPL").await.unwrap();
        assert!(quote.price > 0.0);
    }
}
