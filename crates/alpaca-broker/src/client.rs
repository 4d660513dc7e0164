use crate::models::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_trait::{
    BrokerAccount, BrokerClient, BrokerOrder, BrokerOrderRequest, BrokerOrderSide,
    BrokerOrderStatus, BrokerPosition,
};
use reqwest::{header, Client};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaClient {
    pub fn new(api_key: String, secret_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            secret_key,
        })
    }

    /// Create client from environment variables. Accepts both the standard
    /// Alpaca names and ALPACA_* fallbacks.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("APCA_API_KEY_ID")
            .or_else(|_| std::env::var("ALPACA_API_KEY"))
            .map_err(|_| anyhow!("APCA_API_KEY_ID (or ALPACA_API_KEY) not set"))?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")
            .or_else(|_| std::env::var("ALPACA_SECRET_KEY"))
            .map_err(|_| anyhow!("APCA_API_SECRET_KEY (or ALPACA_SECRET_KEY) not set"))?;
        let base_url = std::env::var("ALPACA_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());

        Self::new(api_key, secret_key, base_url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&self.api_key)
                .map_err(|_| anyhow!("API key contains invalid header characters"))?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&self.secret_key)
                .map_err(|_| anyhow!("Secret key contains invalid header characters"))?,
        );
        Ok(headers)
    }

    pub async fn get_account(&self) -> Result<Account> {
        let url = format!("{}/v2/account", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Alpaca API error: {}", error_text));
        }

        Ok(response.json::<Account>().await?)
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.base_url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Failed to get positions: {}", error_text));
        }

        Ok(response.json::<Vec<Position>>().await?)
    }

    pub async fn submit_order(&self, order: OrderRequest) -> Result<Order> {
        let url = format!("{}/v2/orders", self.base_url);

        tracing::info!(
            "Submitting {:?} {} x{} to Alpaca",
            order.side,
            order.symbol,
            order.qty
        );

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&order)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Alpaca order failed: {}", error_text));
        }

        let order_response = response.json::<Order>().await?;
        tracing::info!("Order submitted: {}", order_response.id);
        Ok(order_response)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Order> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Failed to get order: {}", error_text));
        }

        Ok(response.json::<Order>().await?)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);

        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Failed to cancel order: {}", error_text));
        }

        tracing::info!("Order {} canceled", order_id);
        Ok(())
    }

    pub fn is_paper(&self) -> bool {
        self.base_url.contains("paper-api")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers: Alpaca types -> unified BrokerClient types
// ---------------------------------------------------------------------------

fn decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

/// Collapse Alpaca's order states into the unified lifecycle. In-flight
/// states ("new", "accepted", "pending_new", "partially_filled") read as
/// submitted until a terminal state arrives.
fn map_status(status: &str) -> BrokerOrderStatus {
    match status {
        "filled" => BrokerOrderStatus::Filled,
        "canceled" | "expired" | "replaced" | "done_for_day" => BrokerOrderStatus::Cancelled,
        "rejected" | "stopped" | "suspended" => BrokerOrderStatus::Rejected,
        _ => BrokerOrderStatus::Submitted,
    }
}

fn account_to_broker(a: Account) -> BrokerAccount {
    BrokerAccount {
        id: a.id,
        status: a.status,
        currency: a.currency,
        buying_power: decimal(&a.buying_power),
        cash: decimal(&a.cash),
        portfolio_value: decimal(&a.portfolio_value),
        trading_blocked: a.trading_blocked || a.account_blocked,
    }
}

fn position_to_broker(p: Position) -> BrokerPosition {
    BrokerPosition {
        symbol: p.symbol,
        qty: decimal(&p.qty),
        avg_entry_price: decimal(&p.avg_entry_price),
        market_value: decimal(&p.market_value),
        unrealized_pl: decimal(&p.unrealized_pl),
    }
}

fn order_to_broker(o: Order) -> BrokerOrder {
    BrokerOrder {
        status: map_status(&o.status),
        side: if o.side == "sell" {
            BrokerOrderSide::Sell
        } else {
            BrokerOrderSide::Buy
        },
        qty: o.quantity.as_deref().map(decimal).unwrap_or_default(),
        filled_qty: o.filled_quantity.as_deref().map(decimal),
        filled_avg_price: o.filled_avg_price.as_deref().map(decimal),
        id: o.id,
        symbol: o.symbol,
        created_at: o.created_at,
        filled_at: o.filled_at,
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    async fn get_account(&self) -> Result<BrokerAccount> {
        self.get_account().await.map(account_to_broker)
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.get_positions()
            .await
            .map(|ps| ps.into_iter().map(position_to_broker).collect())
    }

    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        let side = match order.side {
            BrokerOrderSide::Buy => OrderSide::Buy,
            BrokerOrderSide::Sell => OrderSide::Sell,
        };
        let request = OrderRequest::market(order.symbol, order.qty, side);
        self.submit_order(request).await.map(order_to_broker)
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder> {
        self.get_order(order_id).await.map(order_to_broker)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.cancel_order(order_id).await
    }

    fn is_paper(&self) -> bool {
        self.is_paper()
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}
