//! Binance spot REST client
//!
//! Public market-data endpoints need no credentials; order endpoints are
//! signed with HMAC-SHA256 over the query string. Every call goes through
//! the rate limiter and circuit breaker, with bounded timeouts and
//! exponential-backoff retries for transient failures.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::common::{CircuitBreaker, RateLimiter};
use crate::{Candle, Side};

use super::auth::{sign_query, Credentials};
use super::types::{AssetBalance, OrderAck, RawKline, Ticker};
use super::{Exchange, ExchangeError, SymbolFilters};

/// Mainnet REST base URL
pub const API_BASE_URL: &str = "https://api.binance.com";

/// Testnet REST base URL
pub const TESTNET_BASE_URL: &str = "https://testnet.binance.vision";

/// Maximum klines per request (exchange limit)
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub requests_per_second: usize,
    /// Signed requests: tolerated clock skew window in milliseconds
    pub recv_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: API_BASE_URL.to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(10),
            requests_per_second: 10,
            recv_window_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn testnet(mut self) -> Self {
        self.base_url = TESTNET_BASE_URL.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Binance REST API client
#[derive(Clone)]
pub struct BinanceClient {
    credentials: Credentials,
    http_client: Client,
    base_url: String,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
    recv_window_ms: u64,
    symbol_filters: HashMap<String, SymbolFilters>,
}

impl BinanceClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_config(api_key, api_secret, ClientConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        BinanceClient {
            credentials: Credentials::new(api_key, api_secret),
            http_client,
            base_url: config.base_url,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::with_defaults())),
            rate_limiter: RateLimiter::new(config.requests_per_second),
            max_retries: config.max_retries,
            recv_window_ms: config.recv_window_ms,
            symbol_filters: HashMap::new(),
        }
    }

    /// Load credentials from `BINANCE_API_KEY` / `BINANCE_API_SECRET`
    pub fn from_env(config: ClientConfig) -> Result<Self, ExchangeError> {
        let credentials = Credentials::from_env().ok_or_else(|| {
            ExchangeError::InvalidResponse(
                "BINANCE_API_KEY / BINANCE_API_SECRET not set in environment".to_string(),
            )
        })?;
        Ok(Self::with_config(
            credentials.api_key().to_string(),
            credentials.api_secret().to_string(),
            config,
        ))
    }

    /// Install the per-symbol filter table (from config)
    pub fn set_symbol_filters(&mut self, filters: HashMap<String, SymbolFilters>) {
        self.symbol_filters = filters;
    }

    /// Execute an operation behind the rate limiter, circuit breaker, and
    /// retry-with-backoff. Rejections are never retried.
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(ExchangeError::Network(
                    "circuit breaker is open, rejecting request".to_string(),
                ));
            }
        }

        self.rate_limiter.acquire().await;

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                debug!("Retrying after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            match operation().await {
                Ok(result) => {
                    let mut cb = self.circuit_breaker.lock().await;
                    cb.record_success();
                    return Ok(result);
                }
                Err(e) if !e.is_transient() => {
                    // Final failure (rejection, 4xx): no point retrying
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        {
            let mut cb = self.circuit_breaker.lock().await;
            cb.record_failure();
        }

        Err(last_error
            .unwrap_or_else(|| ExchangeError::Network("request failed after retries".to_string())))
    }

    async fn check_response(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let text = response.text().await.map_err(ExchangeError::from)?;

        if status.is_success() {
            Ok(text)
        } else if status.as_u16() == 400 {
            // Order-level rejection (insufficient balance, bad filter, ...)
            Err(ExchangeError::Rejected(text))
        } else {
            Err(ExchangeError::Api {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// Build a signed query string with timestamp and recvWindow
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("recvWindow".to_string(), self.recv_window_ms.to_string()));
        params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let signature = sign_query(&query, self.credentials.api_secret());
        format!("{}&signature={}", query, signature)
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.execute_with_retry(|| {
            let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
            let client = self.http_client.clone();
            let symbol = symbol.to_string();

            async move {
                let response = client.get(&url).send().await.map_err(ExchangeError::from)?;
                let text = Self::check_response(response).await?;

                #[derive(serde::Deserialize)]
                struct PriceResponse {
                    price: String,
                }

                let parsed: PriceResponse = serde_json::from_str(&text)
                    .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
                let price: f64 = parsed
                    .price
                    .parse()
                    .map_err(|_| ExchangeError::InvalidResponse(parsed.price.clone()))?;

                Ok(Ticker { symbol, price })
            }
        })
        .await
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let limit = limit.min(MAX_KLINES_PER_REQUEST);

        self.execute_with_retry(|| {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit={}",
                self.base_url, symbol, interval, limit
            );
            let client = self.http_client.clone();

            async move {
                let response = client.get(&url).send().await.map_err(ExchangeError::from)?;
                let text = Self::check_response(response).await?;

                let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(&text)
                    .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

                let mut candles: Vec<Candle> = raw
                    .iter()
                    .filter_map(|row| RawKline::from_row(row))
                    .map(Candle::from)
                    .collect();

                candles.sort_by_key(|c| c.datetime);
                Ok(candles)
            }
        })
        .await
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("quantity".to_string(), format!("{}", quantity)),
            ("price".to_string(), format!("{}", price)),
        ];
        let query = self.signed_query(params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        // Placement is not retried: a timed-out POST may or may not have
        // created an order, so it surfaces as an error for the caller to
        // treat as a rejection.
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(ExchangeError::Network(
                    "circuit breaker is open, rejecting request".to_string(),
                ));
            }
        }
        self.rate_limiter.acquire().await;

        let response = self
            .http_client
            .post(&url)
            .header("X-MBX-APIKEY", self.credentials.api_key())
            .send()
            .await
            .map_err(ExchangeError::from)?;
        let text = Self::check_response(response).await?;

        #[derive(serde::Deserialize)]
        struct OrderResponse {
            #[serde(rename = "orderId")]
            order_id: Option<serde_json::Value>,
            #[serde(rename = "clientOrderId")]
            client_order_id: Option<String>,
        }

        let parsed: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        // An ack without a usable id cannot be cancelled later; refuse it
        // rather than tracking an unmanageable order.
        let order_id = match parsed.order_id {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) if !s.is_empty() && s != "N/A" => s,
            _ => {
                return Err(ExchangeError::InvalidResponse(format!(
                    "order ack without usable orderId: {}",
                    text
                )))
            }
        };

        {
            let mut cb = self.circuit_breaker.lock().await;
            cb.record_success();
        }

        Ok(OrderAck {
            order_id,
            client_order_id: parsed.client_order_id,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let query = self.signed_query(params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        self.rate_limiter.acquire().await;

        let response = self
            .http_client
            .delete(&url)
            .header("X-MBX-APIKEY", self.credentials.api_key())
            .send()
            .await
            .map_err(ExchangeError::from)?;

        match Self::check_response(response).await {
            Ok(_) => Ok(true),
            // Already filled or expired on the exchange side
            Err(ExchangeError::Rejected(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let query = self.signed_query(params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, query);
        let api_key = self.credentials.api_key().to_string();

        self.execute_with_retry(|| {
            let client = self.http_client.clone();
            let url = url.clone();
            let api_key = api_key.clone();

            async move {
                let response = client
                    .get(&url)
                    .header("X-MBX-APIKEY", api_key)
                    .send()
                    .await
                    .map_err(ExchangeError::from)?;
                let text = Self::check_response(response).await?;

                #[derive(serde::Deserialize)]
                struct OpenOrder {
                    #[serde(rename = "orderId")]
                    order_id: serde_json::Value,
                }

                let orders: Vec<OpenOrder> = serde_json::from_str(&text)
                    .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

                Ok(orders.into_iter().map(|o| o.order_id.to_string()).collect())
            }
        })
        .await
    }

    async fn get_account_balance(
        &self,
    ) -> Result<HashMap<String, AssetBalance>, ExchangeError> {
        let query = self.signed_query(Vec::new());
        let url = format!("{}/api/v3/account?{}", self.base_url, query);
        let api_key = self.credentials.api_key().to_string();

        self.execute_with_retry(|| {
            let client = self.http_client.clone();
            let url = url.clone();
            let api_key = api_key.clone();

            async move {
                let response = client
                    .get(&url)
                    .header("X-MBX-APIKEY", api_key)
                    .send()
                    .await
                    .map_err(ExchangeError::from)?;
                let text = Self::check_response(response).await?;

                #[derive(serde::Deserialize)]
                struct BalanceEntry {
                    asset: String,
                    free: String,
                    locked: String,
                }

                #[derive(serde::Deserialize)]
                struct AccountResponse {
                    balances: Vec<BalanceEntry>,
                }

                let account: AccountResponse = serde_json::from_str(&text)
                    .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

                let mut balances = HashMap::new();
                for entry in account.balances {
                    let free: f64 = entry.free.parse().unwrap_or(0.0);
                    let locked: f64 = entry.locked.parse().unwrap_or(0.0);
                    if free + locked > 0.0 {
                        balances.insert(entry.asset, AssetBalance { free, locked });
                    }
                }

                Ok(balances)
            }
        })
        .await
    }

    fn filters(&self, symbol: &str) -> SymbolFilters {
        self.symbol_filters
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }
}
