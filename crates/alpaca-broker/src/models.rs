use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub status: String,
    pub currency: String,
    pub buying_power: String,
    pub cash: String,
    pub portfolio_value: String,
    pub trading_blocked: bool,
    pub account_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: String,
    pub avg_entry_price: String,
    pub market_value: String,
    pub unrealized_pl: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Market order payload for POST /v2/orders
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub time_in_force: String,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, qty: impl ToString, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty: qty.to_string(),
            side,
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    #[serde(rename = "qty")]
    pub quantity: Option<String>,
    #[serde(rename = "filled_qty")]
    pub filled_quantity: Option<String>,
    pub filled_avg_price: Option<String>,
    pub side: String,
    pub status: String,
}
