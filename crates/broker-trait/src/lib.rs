use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub id: String,
    pub status: String,
    pub currency: String,
    pub buying_power: Decimal,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub trading_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderSide {
    Buy,
    Sell,
}

/// Unified order lifecycle state across brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderStatus {
    Submitted,
    Filled,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: BrokerOrderSide,
}

impl BrokerOrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Buy,
        }
    }

    pub fn sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: BrokerOrderSide,
    pub qty: Decimal,
    pub status: BrokerOrderStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Get account information (balance, buying power, etc.)
    async fn get_account(&self) -> Result<BrokerAccount>;

    /// Get all open positions (the source of a snapshot's holdings)
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Submit a market order
    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder>;

    /// Poll an order's fill status by id
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder>;

    /// Cancel an order by id
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}
