use std::future::Future;
use std::sync::Arc;

use agent_core::{AgentError, Interval};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Market data classes with distinct caching policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    DailyOhlcv,
    WeeklyOhlcv,
    MonthlyOhlcv,
    /// Minute/hour bars, always fetched fresh
    IntradayBars,
    /// Real-time quote, always fetched fresh
    Quote,
    /// Derived indicator series (RSI, SMA, MACD)
    DerivedIndicator,
    /// Options analytics such as the put/call ratio
    OptionsAnalytics,
    /// Company overview fundamentals
    Fundamentals,
    /// News with provider sentiment scores
    News,
}

impl DataClass {
    /// Seconds an entry stays valid, or None for never-cached classes.
    pub fn ttl_seconds(&self) -> Option<i64> {
        match self {
            DataClass::DailyOhlcv => Some(6 * 3600),
            DataClass::WeeklyOhlcv | DataClass::MonthlyOhlcv => Some(24 * 3600),
            DataClass::DerivedIndicator | DataClass::OptionsAnalytics | DataClass::News => {
                Some(3600)
            }
            DataClass::Fundamentals => Some(24 * 3600),
            DataClass::IntradayBars | DataClass::Quote => None,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.ttl_seconds().is_some()
    }

    fn key_tag(&self) -> &'static str {
        match self {
            DataClass::DailyOhlcv => "ohlcv_daily",
            DataClass::WeeklyOhlcv => "ohlcv_weekly",
            DataClass::MonthlyOhlcv => "ohlcv_monthly",
            DataClass::IntradayBars => "ohlcv_intraday",
            DataClass::Quote => "quote",
            DataClass::DerivedIndicator => "indicator",
            DataClass::OptionsAnalytics => "pcr",
            DataClass::Fundamentals => "overview",
            DataClass::News => "news",
        }
    }
}

/// Cached payload with its freshness metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.calculated_at).num_seconds() < self.ttl_seconds
    }
}

/// Result of a cache consultation
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub payload: serde_json::Value,
    pub is_cache_hit: bool,
}

/// Memoizes externally-fetched market data with per-class TTLs.
/// Intraday bars and quotes are never cached; concurrent misses on one key
/// collapse to a single upstream fetch; a failed fetch leaves any prior
/// valid entry untouched.
pub struct MarketDataCache {
    entries: DashMap<String, CacheEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl Default for MarketDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Stable composite key over class, symbol, interval, and params.
    pub fn key(
        class: DataClass,
        symbol: &str,
        interval: Option<Interval>,
        params: &serde_json::Value,
    ) -> String {
        let mut key = format!("market:{}:{}", class.key_tag(), symbol.to_uppercase());
        if let Some(interval) = interval {
            key.push(':');
            key.push_str(interval.as_str());
        }
        if !params.is_null() && params != &serde_json::json!({}) {
            // serde_json maps serialize with sorted keys, so the digest is
            // stable across param orderings.
            let mut hasher = Sha256::new();
            hasher.update(params.to_string().as_bytes());
            let digest = hex::encode(hasher.finalize());
            key.push(':');
            key.push_str(&digest[..12]);
        }
        key
    }

    /// Return the payload for this key, fetching on a miss. Two calls with
    /// identical keys within the TTL window invoke the fetcher exactly once
    /// and return bit-identical payloads.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        class: DataClass,
        symbol: &str,
        interval: Option<Interval>,
        params: &serde_json::Value,
        fetcher: F,
    ) -> Result<CacheLookup, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, AgentError>>,
    {
        let key = Self::key(class, symbol, interval, params);

        // Never-cached classes bypass the store entirely: no entry is
        // created and every request re-invokes the fetcher.
        if !class.is_cacheable() {
            let payload = fetcher()
                .await
                .map_err(|e| AgentError::CacheFetch(e.to_string()))?;
            return Ok(CacheLookup {
                payload,
                is_cache_hit: false,
            });
        }

        if let Some(entry) = self.fresh_entry(&key) {
            tracing::debug!("Cache hit for {}", key);
            return Ok(CacheLookup {
                payload: entry.payload,
                is_cache_hit: true,
            });
        }

        // Single-flight: one fetch per key; later arrivals wait, then
        // re-check the store instead of issuing a duplicate upstream call.
        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.fresh_entry(&key) {
            tracing::debug!("Cache hit for {} after awaiting in-flight fetch", key);
            return Ok(CacheLookup {
                payload: entry.payload,
                is_cache_hit: true,
            });
        }

        let ttl_seconds = class.ttl_seconds().unwrap_or(0);
        let payload = fetcher()
            .await
            .map_err(|e| AgentError::CacheFetch(e.to_string()))?;

        self.entries.insert(
            key.clone(),
            CacheEntry {
                payload: payload.clone(),
                calculated_at: Utc::now(),
                ttl_seconds,
            },
        );
        tracing::debug!("Cache miss for {}, stored with ttl {}s", key, ttl_seconds);

        Ok(CacheLookup {
            payload,
            is_cache_hit: false,
        })
    }

    /// Direct probe without fetching. Expired entries read as absent.
    pub fn lookup(
        &self,
        class: DataClass,
        symbol: &str,
        interval: Option<Interval>,
        params: &serde_json::Value,
    ) -> Option<CacheEntry> {
        self.fresh_entry(&Self::key(class, symbol, interval, params))
    }

    /// Drop all entries past their TTL.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh_entry(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(Utc::now()) {
            Some(entry.clone())
        } else {
            None
        }
    }

    #[cfg(test)]
    fn insert_backdated(&self, key: &str, payload: serde_json::Value, age_seconds: i64, ttl: i64) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                calculated_at: Utc::now() - chrono::Duration::seconds(age_seconds),
                ttl_seconds: ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_fetcher(
        counter: Arc<AtomicUsize>,
        payload: serde_json::Value,
    ) -> impl FnOnce() -> std::pin::Pin<
        Box<dyn Future<Output = Result<serde_json::Value, AgentError>> + Send>,
    > {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(payload) })
        }
    }

    #[tokio::test]
    async fn cacheable_class_fetches_once_within_ttl() {
        let cache = MarketDataCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let payload = serde_json::json!({"close": 182.5});

        let first = cache
            .get_or_fetch(
                DataClass::DailyOhlcv,
                "AAPL",
                Some(Interval::Daily),
                &serde_json::json!({}),
                counted_fetcher(calls.clone(), payload.clone()),
            )
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(
                DataClass::DailyOhlcv,
                "AAPL",
                Some(Interval::Daily),
                &serde_json::json!({}),
                counted_fetcher(calls.clone(), serde_json::json!({"close": 999.0})),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.is_cache_hit);
        assert!(second.is_cache_hit);
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn intraday_requests_always_refetch_and_never_store() {
        let cache = MarketDataCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let params = serde_json::json!({});

        for _ in 0..3 {
            let lookup = cache
                .get_or_fetch(
                    DataClass::IntradayBars,
                    "NVDA",
                    Some(Interval::Min5),
                    &params,
                    counted_fetcher(calls.clone(), serde_json::json!([1, 2, 3])),
                )
                .await
                .unwrap();
            assert!(!lookup.is_cache_hit);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache
            .lookup(DataClass::IntradayBars, "NVDA", Some(Interval::Min5), &params)
            .is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn put_call_ratio_entry_lifecycle() {
        let cache = MarketDataCache::new();
        let params = serde_json::json!({});

        // Absent on direct check before the first call
        assert!(cache
            .lookup(DataClass::OptionsAnalytics, "NVDA", None, &params)
            .is_none());

        cache
            .get_or_fetch(
                DataClass::OptionsAnalytics,
                "NVDA",
                None,
                &params,
                || async { Ok(serde_json::json!({"ratio": 0.82})) },
            )
            .await
            .unwrap();

        let entry = cache
            .lookup(DataClass::OptionsAnalytics, "NVDA", None, &params)
            .expect("entry populated after first call");
        assert_eq!(entry.ttl_seconds, 3600);
        assert_eq!(entry.payload, serde_json::json!({"ratio": 0.82}));
    }

    #[tokio::test]
    async fn failed_fetch_preserves_prior_entry() {
        let cache = MarketDataCache::new();
        let params = serde_json::json!({"period": 14});
        let key = MarketDataCache::key(
            DataClass::DerivedIndicator,
            "AAPL",
            Some(Interval::Daily),
            &params,
        );

        // Expired prior entry: the next call must go upstream
        cache.insert_backdated(&key, serde_json::json!({"rsi": 55.0}), 4000, 3600);
        let result = cache
            .get_or_fetch(
                DataClass::DerivedIndicator,
                "AAPL",
                Some(Interval::Daily),
                &params,
                || async { Err(AgentError::MarketData("upstream down".into())) },
            )
            .await;

        assert!(matches!(result, Err(AgentError::CacheFetch(_))));
        // The stale entry is still physically present (not poisoned/replaced)
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = MarketDataCache::new();
        let params = serde_json::json!({});
        let key = MarketDataCache::key(DataClass::Fundamentals, "MSFT", None, &params);
        cache.insert_backdated(&key, serde_json::json!({"pe": 30}), 90_000, 86_400);

        assert!(cache
            .lookup(DataClass::Fundamentals, "MSFT", None, &params)
            .is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_fetch() {
        let cache = Arc::new(MarketDataCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(
                        DataClass::DailyOhlcv,
                        "GOOG",
                        Some(Interval::Daily),
                        &serde_json::json!({}),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            Ok(serde_json::json!({"close": 140.0}))
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut hits = 0;
        for handle in handles {
            if handle.await.unwrap().is_cache_hit {
                hits += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 3);
    }

    #[test]
    fn keys_are_stable_and_param_sensitive() {
        let a = MarketDataCache::key(
            DataClass::DerivedIndicator,
            "aapl",
            Some(Interval::Daily),
            &serde_json::json!({"indicator": "rsi", "period": 14}),
        );
        let b = MarketDataCache::key(
            DataClass::DerivedIndicator,
            "AAPL",
            Some(Interval::Daily),
            &serde_json::json!({"period": 14, "indicator": "rsi"}),
        );
        let c = MarketDataCache::key(
            DataClass::DerivedIndicator,
            "AAPL",
            Some(Interval::Daily),
            &serde_json::json!({"indicator": "rsi", "period": 21}),
        );

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("market:indicator:AAPL:daily:"));
    }
}
