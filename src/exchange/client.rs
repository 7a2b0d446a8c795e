//! Signed REST client for the exchange.
//!
//! Private endpoints (`/accounts`, `/orders`) are HMAC-signed per request.
//! Idempotent requests (GET, DELETE) are retried on transport failures and
//! transient statuses with exponential backoff plus random jitter. Order
//! placement (POST) is sent exactly once: a lost response must never turn
//! into a duplicate order.
//!
//! Public market reads (ticker, book) are served from a per-product TTL
//! cache: repeated reads of the same endpoint within the window make no
//! network call.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::{unix_timestamp, Credentials};
use super::cache::TtlCache;
use super::Exchange;
use crate::types::{
    fmt_native, parse_native, Account, BalancerError, OrderOutcome, PlacedOrder, Product, Spread,
    Ticker,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://api.exchange.coinbase.com";
const USER_AGENT: &str = "BALANCER/0.1.0 (rebalancing-agent)";

/// Retry schedule for idempotent requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the uniform random delay added to each wait.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            jitter: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Only requests that are safe to repeat get retries.
    pub fn retries_for(&self, method: &Method) -> u32 {
        if *method == Method::GET || *method == Method::DELETE {
            self.max_retries
        } else {
            0
        }
    }

    /// Deterministic part of the wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Full wait before retry number `attempt`: backoff plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.backoff(attempt) + jitter
    }
}

/// Connection settings for `SignedClient`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub public_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            public_cache_ttl: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountEntry {
    id: String,
    currency: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    price: String,
    #[serde(default)]
    bid: Option<String>,
    #[serde(default)]
    ask: Option<String>,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

/// Level-1 book: each level is `[price, size, num_orders]`.
#[derive(Debug, Deserialize)]
struct BookEntry {
    #[serde(default)]
    bids: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    asks: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    price: String,
    size: String,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    product_id: &'a str,
    post_only: bool,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Transport(reqwest::Error),
    Status { status: StatusCode, message: String },
    Local(BalancerError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Transport(_) => true,
            AttemptError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            AttemptError::Local(_) => false,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Transport(e) => write!(f, "transport: {e}"),
            AttemptError::Status { status, message } => write!(f, "HTTP {status}: {message}"),
            AttemptError::Local(e) => write!(f, "{e}"),
        }
    }
}

impl From<AttemptError> for BalancerError {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Transport(err) => BalancerError::Transport(err.to_string()),
            AttemptError::Status { status, message } => BalancerError::Api {
                status: status.as_u16(),
                message,
            },
            AttemptError::Local(err) => err,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated, retrying exchange client.
pub struct SignedClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    retry: RetryPolicy,
    tickers: TtlCache<Product, Ticker>,
    books: TtlCache<Product, Spread>,
}

impl SignedClient {
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build exchange HTTP client")?;

        let client = Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            retry: config.retry,
            tickers: TtlCache::new(config.public_cache_ttl),
            books: TtlCache::new(config.public_cache_ttl),
        };

        info!(
            base_url = %client.base_url,
            access_key = client.credentials.access_key(),
            max_retries = client.retry.max_retries,
            public_cache_ttl_ms = client.tickers.ttl().as_millis() as u64,
            "Exchange client ready"
        );

        Ok(client)
    }

    /// Send a request, retrying only where the method allows it.
    /// Returns the body of the first 2xx response.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        signed: bool,
    ) -> Result<String, BalancerError> {
        let body = body.unwrap_or_default();
        let retries = self.retry.retries_for(&method);
        let mut attempt = 0;

        loop {
            match self.send_once(&method, path, &body, signed).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < retries && e.is_transient() => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        method = %method,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying exchange request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(method = %method, path, attempts = attempt + 1, error = %e, "Exchange request failed");
                    return Err(e.into());
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: &str,
        signed: bool,
    ) -> Result<String, AttemptError> {
        let url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %url, "Exchange request");

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if signed {
            // The timestamp is part of the signature, so each attempt re-signs.
            let headers = self
                .credentials
                .headers(&unix_timestamp(), method.as_str(), path, body)
                .map_err(AttemptError::Local)?;
            for (name, value) in headers {
                req = req.header(name, value);
            }
        }
        if !body.is_empty() {
            req = req.body(body.to_string());
        }

        let resp = req.send().await.map_err(AttemptError::Transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(AttemptError::Transport)?;

        if status.is_success() {
            return Ok(text);
        }

        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .map(|b| b.message)
            .filter(|m| !m.is_empty())
            .unwrap_or(text);
        Err(AttemptError::Status { status, message })
    }

    fn decode<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T, BalancerError> {
        serde_json::from_str(text)
            .map_err(|e| BalancerError::Decode(format!("{what}: {e}")))
    }

    /// Price of the first level on one side of the book, if any.
    fn best_level(levels: &[Vec<serde_json::Value>]) -> Result<Option<i64>, BalancerError> {
        let Some(level) = levels.first() else {
            return Ok(None);
        };
        let price = level
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| BalancerError::Decode(format!("malformed book level: {level:?}")))?;
        parse_native(price).map(Some)
    }

    fn parse_optional(s: Option<&str>, field: &str) -> Option<f64> {
        let raw = s?;
        match Self::parse_f64(raw, field) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed ticker field");
                None
            }
        }
    }

    fn parse_f64(s: &str, field: &str) -> Result<f64, BalancerError> {
        s.trim()
            .parse::<f64>()
            .map_err(|e| BalancerError::Decode(format!("{field} {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Exchange trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for SignedClient {
    async fn accounts(&self) -> Result<Vec<Account>> {
        let text = self.request(Method::GET, "/accounts", None, true).await?;
        let entries: Vec<AccountEntry> = Self::decode(&text, "accounts")?;

        let mut accounts = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = uuid::Uuid::parse_str(&entry.id)
                .map_err(|e| BalancerError::Decode(format!("account id {:?}: {e}", entry.id)))?;
            accounts.push(Account {
                id,
                currency: entry.currency,
                balance: parse_native(&entry.balance)?,
            });
        }

        debug!(count = accounts.len(), "Fetched accounts");
        Ok(accounts)
    }

    async fn ticker(&self, product: Product) -> Result<Ticker> {
        if let Some(cached) = self.tickers.get(&product) {
            debug!(product = %product, "Ticker cache hit");
            return Ok(cached);
        }

        let path = format!("/products/{}/ticker", product.id());
        let text = self.request(Method::GET, &path, None, false).await?;
        let entry: TickerEntry = Self::decode(&text, "ticker")?;

        let ticker = Ticker {
            price: Self::parse_f64(&entry.price, "price")?,
            // Informational fields; a malformed one must not cost us the price.
            bid: Self::parse_optional(entry.bid.as_deref(), "bid"),
            ask: Self::parse_optional(entry.ask.as_deref(), "ask"),
            volume: Self::parse_optional(entry.volume.as_deref(), "volume"),
            time: entry.time,
        };

        self.tickers.insert(product, ticker.clone());
        Ok(ticker)
    }

    async fn book(&self, product: Product) -> Result<Spread> {
        if let Some(cached) = self.books.get(&product) {
            debug!(product = %product, "Book cache hit");
            return Ok(cached);
        }

        let path = format!("/products/{}/book", product.id());
        let text = self.request(Method::GET, &path, None, false).await?;
        let entry: BookEntry = Self::decode(&text, "book")?;

        let spread = Spread {
            bid: Self::best_level(&entry.bids)?,
            ask: Self::best_level(&entry.asks)?,
        };

        self.books.insert(product, spread);
        Ok(spread)
    }

    async fn place_order(&self, order: PlacedOrder) -> Result<OrderOutcome> {
        let request = OrderRequest {
            price: fmt_native(order.price),
            size: fmt_native(order.size),
            side: order.side.as_str(),
            order_type: "limit",
            product_id: order.product.id(),
            post_only: true,
        };
        let body = serde_json::to_string(&request).context("Failed to encode order request")?;

        info!(order = %order, body = %body, "Submitting order");
        let text = self.request(Method::POST, "/orders", Some(body), true).await?;
        let resp: OrderResponse = Self::decode(&text, "order response")?;

        if resp.status == "rejected" {
            return Ok(OrderOutcome::Rejected {
                reason: resp.reject_reason.unwrap_or_else(|| "unspecified".to_string()),
            });
        }

        Ok(OrderOutcome::Accepted {
            id: resp.id.unwrap_or_default(),
            status: resp.status,
        })
    }

    async fn cancel_all_orders(&self) -> Result<usize> {
        let text = self.request(Method::DELETE, "/orders", None, true).await?;
        match serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            Ok(ids) => {
                info!(cancelled = ids.len(), "Cancelled open orders");
                Ok(ids.len())
            }
            Err(e) => {
                // The exchange acknowledged the cancel; only the id list is unreadable.
                warn!(error = %e, body = %text, "Cancel-all reply did not decode as an id list");
                Ok(0)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
