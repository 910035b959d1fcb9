//! Exchange gateway - order placement, cancellation, status polling, depth
//! lookup and merge settlement against the Polymarket CLOB.
//!
//! The trait is the seam the scheduler and lifecycle manager run against;
//! the production implementation speaks raw HTTP with HMAC-signed L2 auth
//! headers. Tests use the mock in `mock::`.

use super::clob_errors::ClobError;
use super::rate_limiter::{EndpointClass, RateLimiter};
use super::retry::{with_retry, RetryConfig};
use crate::config::ClobApiConfig;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{info, warn};

const RELAY_URL: &str = "https://relayer-v2.polymarket.com";

/// State of an order as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Snapshot of one order's state at the exchange
#[derive(Debug, Clone)]
pub struct OrderStatusResult {
    pub order_id: String,
    pub state: ExchangeOrderState,
    pub fill_price: Option<Decimal>,
    pub size_matched: Decimal,
}

/// Capability the core trades through. One implementation per venue;
/// the mock drives the state-machine tests.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a GTC limit BUY. Returns the exchange order id.
    async fn place_limit_order(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError>;

    /// Cancel an order. Returns false when the order was already gone.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ClobError>;

    /// Cancel an order and place its replacement. Returns the new order id.
    async fn cancel_and_replace_order(
        &self,
        order_id: &str,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError>;

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult, ClobError>;

    /// Best ask for a token, None when the book is empty/unavailable.
    async fn get_best_ask(&self, token_id: &str) -> Result<Option<Decimal>, ClobError>;

    /// Merge matched share pairs back to collateral. Returns the relay
    /// transaction id.
    async fn merge_shares(&self, condition_id: &str, qty: Decimal) -> Result<String, ClobError>;
}

/// Production gateway against the Polymarket CLOB REST API
pub struct ClobGateway {
    client: reqwest::Client,
    config: ClobApiConfig,
    limiter: RateLimiter,
    retry: RetryConfig,
}

impl ClobGateway {
    pub fn new(config: ClobApiConfig) -> Result<Self, ClobError> {
        let client = reqwest::Client::builder()
            .user_agent("courtside-bot/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ClobError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            config,
            limiter: RateLimiter::new(),
            retry: RetryConfig::polling(),
        })
    }

    /// HMAC-SHA256 L2 auth headers over `timestamp + method + path + body`
    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(&'static str, String)>, ClobError> {
        use base64::Engine;
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let address = self
            .config
            .wallet_address
            .as_deref()
            .ok_or(ClobError::AuthenticationFailed)?;
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ClobError::AuthenticationFailed)?;
        let api_secret = self
            .config
            .api_secret
            .as_deref()
            .ok_or(ClobError::AuthenticationFailed)?;
        let passphrase = self
            .config
            .api_passphrase
            .as_deref()
            .ok_or(ClobError::AuthenticationFailed)?;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let sig_payload = format!("{}{}{}{}", timestamp, method, path, body);

        // Secrets come in several base64 flavors depending on how the key
        // was derived
        let secret_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(api_secret)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(api_secret))
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(api_secret))
            .map_err(|_| ClobError::AuthenticationFailed)?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|_| ClobError::AuthenticationFailed)?;
        mac.update(sig_payload.as_bytes());
        let signature =
            base64::engine::general_purpose::URL_SAFE.encode(mac.finalize().into_bytes());

        Ok(vec![
            ("POLY_ADDRESS", address.to_string()),
            ("POLY_SIGNATURE", signature),
            ("POLY_TIMESTAMP", timestamp),
            ("POLY_API_KEY", api_key.to_string()),
            ("POLY_PASSPHRASE", passphrase.to_string()),
        ])
    }

    async fn place_limit_order_once(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError> {
        // The CLOB rejects prices finer than the tick; truncate so the bid
        // stays at or below the intended price
        let price = price.trunc_with_scale(2);

        let path = "/order";
        let body = serde_json::json!({
            "tokenID": token_id,
            "price": price.to_string(),
            "size": shares.to_string(),
            "side": "BUY",
            "orderType": "GTC",
        })
        .to_string();

        let headers = self.auth_headers("POST", path, &body)?;
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClobError::from_network_error(&e))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ClobError::from_response(status.as_u16(), &text));
        }

        let data: serde_json::Value = serde_json::from_str(&text)
            .map_err(|_| ClobError::Unknown { status: status.as_u16(), body: text.clone() })?;
        let order_id = data
            .get("orderID")
            .or_else(|| data.get("orderId"))
            .and_then(|v| v.as_str())
            .ok_or(ClobError::Unknown { status: status.as_u16(), body: text })?;

        info!(
            "Placed GTC BUY: token={} price={} shares={} order={}",
            token_id,
            price,
            shares,
            &order_id[..16.min(order_id.len())]
        );
        Ok(order_id.to_string())
    }

    async fn cancel_order_once(&self, order_id: &str) -> Result<bool, ClobError> {
        let path = "/order";
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        let headers = self.auth_headers("DELETE", path, &body)?;
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self
            .client
            .delete(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClobError::from_network_error(&e))?;
        let status = response.status();

        if status.is_success() {
            info!("Cancelled order {}", &order_id[..16.min(order_id.len())]);
            return Ok(true);
        }

        let text = response.text().await.unwrap_or_default();
        match ClobError::from_response(status.as_u16(), &text) {
            // Already gone is a successful cancel for our purposes
            ClobError::OrderNotFound => Ok(false),
            err => Err(err),
        }
    }

    async fn get_order_status_once(&self, order_id: &str) -> Result<OrderStatusResult, ClobError> {
        let path = format!("/data/order/{}", order_id);
        let headers = self.auth_headers("GET", &path, "")?;
        let url = format!("{}{}", self.config.endpoint, path);

        let mut request = self.client.get(&url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClobError::from_network_error(&e))?;
        let status_code = response.status();

        if status_code == reqwest::StatusCode::NOT_FOUND {
            // Order genuinely doesn't exist; treat as cancelled
            warn!("Order 404: {} — treating as cancelled", &order_id[..16.min(order_id.len())]);
            return Ok(OrderStatusResult {
                order_id: order_id.to_string(),
                state: ExchangeOrderState::Cancelled,
                fill_price: None,
                size_matched: Decimal::ZERO,
            });
        }

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClobError::from_response(status_code.as_u16(), &body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClobError::NetworkError(e.to_string()))?;

        let status = data.get("status").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        let size_matched = data
            .get("size_matched")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let original_size = data
            .get("original_size")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let price = data
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok());

        // Terminal statuses come first: INVALID/CANCELED are final even
        // with a partial fill. The CLOB uses the American spelling.
        let is_terminal = matches!(
            status,
            "CANCELLED" | "CANCELED" | "INVALID" | "CANCELED_MARKET_RESOLVED" | "EXPIRED"
        );
        let state = if is_terminal {
            ExchangeOrderState::Cancelled
        } else if status == "UNKNOWN" && original_size.is_zero() && size_matched.is_zero() {
            // No data for this order: never created or already purged
            ExchangeOrderState::Cancelled
        } else if !size_matched.is_zero()
            && (status == "MATCHED" || size_matched >= original_size * Decimal::new(99, 2))
        {
            ExchangeOrderState::Filled
        } else if status == "MATCHED" && size_matched.is_zero() {
            // MATCHED with no size is API lag; keep polling
            ExchangeOrderState::Open
        } else if !size_matched.is_zero() {
            ExchangeOrderState::PartiallyFilled
        } else {
            ExchangeOrderState::Open
        };

        Ok(OrderStatusResult {
            order_id: order_id.to_string(),
            state,
            fill_price: if size_matched.is_zero() { None } else { price },
            size_matched,
        })
    }

    async fn get_best_ask_once(&self, token_id: &str) -> Result<Option<Decimal>, ClobError> {
        let url = format!(
            "{}/price?token_id={}&side=sell",
            self.config.endpoint,
            urlencoding::encode(token_id)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClobError::from_network_error(&e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClobError::from_response(status, &body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClobError::NetworkError(e.to_string()))?;
        Ok(data
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .filter(|p| *p > Decimal::ZERO))
    }

    async fn merge_shares_once(
        &self,
        condition_id: &str,
        qty: Decimal,
    ) -> Result<String, ClobError> {
        let body = serde_json::json!({
            "type": "MERGE",
            "conditionId": condition_id,
            "amount": qty.to_string(),
        })
        .to_string();

        let headers = self.auth_headers("POST", "/submit", &body)?;
        let url = format!("{}/submit", RELAY_URL);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClobError::from_network_error(&e))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ClobError::from_response(status.as_u16(), &text));
        }

        let data: serde_json::Value = serde_json::from_str(&text)
            .map_err(|_| ClobError::Unknown { status: status.as_u16(), body: text.clone() })?;
        let tx_id = data
            .get("transactionID")
            .or_else(|| data.get("transactionId"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        info!("Merge submitted: condition={} qty={} tx={}", condition_id, qty, tx_id);
        Ok(tx_id.to_string())
    }
}

#[async_trait]
impl ExchangeGateway for ClobGateway {
    async fn place_limit_order(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError> {
        self.limiter.acquire(EndpointClass::PostOrder).await;
        // No blanket retry on placement: a timed-out POST may still have
        // landed, and a duplicate order is worse than a missed tick
        self.place_limit_order_once(token_id, price, shares).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ClobError> {
        self.limiter.acquire(EndpointClass::CancelOrder).await;
        with_retry(&self.retry, "cancel_order", || {
            self.cancel_order_once(order_id)
        })
        .await
    }

    async fn cancel_and_replace_order(
        &self,
        order_id: &str,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError> {
        self.cancel_order(order_id).await?;
        self.place_limit_order(token_id, price, shares).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult, ClobError> {
        self.limiter.acquire(EndpointClass::General).await;
        with_retry(&self.retry, "get_order_status", || {
            self.get_order_status_once(order_id)
        })
        .await
    }

    async fn get_best_ask(&self, token_id: &str) -> Result<Option<Decimal>, ClobError> {
        self.limiter.acquire(EndpointClass::General).await;
        with_retry(&self.retry, "get_best_ask", || {
            self.get_best_ask_once(token_id)
        })
        .await
    }

    async fn merge_shares(&self, condition_id: &str, qty: Decimal) -> Result<String, ClobError> {
        self.limiter.acquire(EndpointClass::PostOrder).await;
        self.merge_shares_once(condition_id, qty).await
    }
}

/// Paper-trading gateway: real market data, synthetic order ids, no
/// exchange writes. Fills themselves are simulated by the scheduler.
pub struct SimGateway {
    inner: ClobGateway,
    next_id: std::sync::atomic::AtomicU64,
}

impl SimGateway {
    pub fn new(config: ClobApiConfig) -> Result<Self, ClobError> {
        Ok(Self {
            inner: ClobGateway::new(config)?,
            next_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("{}-{}", prefix, n)
    }
}

#[async_trait]
impl ExchangeGateway for SimGateway {
    async fn place_limit_order(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError> {
        let id = self.next_id("sim");
        info!(
            "[SIM] Placed BUY: token={} price={} shares={} order={}",
            token_id, price, shares, id
        );
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ClobError> {
        info!("[SIM] Cancelled order {}", order_id);
        Ok(true)
    }

    async fn cancel_and_replace_order(
        &self,
        order_id: &str,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
    ) -> Result<String, ClobError> {
        self.cancel_order(order_id).await?;
        self.place_limit_order(token_id, price, shares).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult, ClobError> {
        Ok(OrderStatusResult {
            order_id: order_id.to_string(),
            state: ExchangeOrderState::Open,
            fill_price: None,
            size_matched: Decimal::ZERO,
        })
    }

    async fn get_best_ask(&self, token_id: &str) -> Result<Option<Decimal>, ClobError> {
        self.inner.get_best_ask(token_id).await
    }

    async fn merge_shares(&self, condition_id: &str, qty: Decimal) -> Result<String, ClobError> {
        let tx = self.next_id("sim-merge");
        info!("[SIM] Merge: condition={} qty={} tx={}", condition_id, qty, tx);
        Ok(tx)
    }
}

#[cfg(test)]
pub mod mock {
    //! Scriptable in-memory gateway for state-machine tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct MockOrder {
        pub token_id: String,
        pub price: Decimal,
        pub shares: Decimal,
        pub cancelled: bool,
    }

    /// Mock gateway: orders rest until the test scripts a status for them.
    #[derive(Default)]
    pub struct MockGateway {
        next_id: AtomicU64,
        pub orders: Mutex<HashMap<String, MockOrder>>,
        /// Scripted status responses, keyed by order id
        pub statuses: Mutex<HashMap<String, OrderStatusResult>>,
        /// Scripted best asks, keyed by token id
        pub best_asks: Mutex<HashMap<String, Decimal>>,
        /// When set, every placement fails with this error
        pub fail_placement: Mutex<Option<ClobError>>,
        pub merges: Mutex<Vec<(String, Decimal)>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script_status(&self, order_id: &str, state: ExchangeOrderState, fill_price: Option<Decimal>, size_matched: Decimal) {
            self.statuses.lock().unwrap().insert(
                order_id.to_string(),
                OrderStatusResult {
                    order_id: order_id.to_string(),
                    state,
                    fill_price,
                    size_matched,
                },
            );
        }

        pub fn script_best_ask(&self, token_id: &str, ask: Decimal) {
            self.best_asks.lock().unwrap().insert(token_id.to_string(), ask);
        }

        pub fn clear_best_ask(&self, token_id: &str) {
            self.best_asks.lock().unwrap().remove(token_id);
        }

        pub fn order_count(&self) -> usize {
            self.orders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_limit_order(
            &self,
            token_id: &str,
            price: Decimal,
            shares: Decimal,
        ) -> Result<String, ClobError> {
            if let Some(err) = self.fail_placement.lock().unwrap().clone() {
                return Err(err);
            }
            let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.orders.lock().unwrap().insert(
                id.clone(),
                MockOrder {
                    token_id: token_id.to_string(),
                    price,
                    shares,
                    cancelled: false,
                },
            );
            Ok(id)
        }

        async fn cancel_order(&self, order_id: &str) -> Result<bool, ClobError> {
            let mut orders = self.orders.lock().unwrap();
            match orders.get_mut(order_id) {
                Some(order) => {
                    order.cancelled = true;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn cancel_and_replace_order(
            &self,
            order_id: &str,
            token_id: &str,
            price: Decimal,
            shares: Decimal,
        ) -> Result<String, ClobError> {
            self.cancel_order(order_id).await?;
            self.place_limit_order(token_id, price, shares).await
        }

        async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusResult, ClobError> {
            if let Some(scripted) = self.statuses.lock().unwrap().get(order_id) {
                return Ok(scripted.clone());
            }
            let orders = self.orders.lock().unwrap();
            match orders.get(order_id) {
                Some(order) => Ok(OrderStatusResult {
                    order_id: order_id.to_string(),
                    state: if order.cancelled {
                        ExchangeOrderState::Cancelled
                    } else {
                        ExchangeOrderState::Open
                    },
                    fill_price: None,
                    size_matched: Decimal::ZERO,
                }),
                None => Ok(OrderStatusResult {
                    order_id: order_id.to_string(),
                    state: ExchangeOrderState::Cancelled,
                    fill_price: None,
                    size_matched: Decimal::ZERO,
                }),
            }
        }

        async fn get_best_ask(&self, token_id: &str) -> Result<Option<Decimal>, ClobError> {
            Ok(self.best_asks.lock().unwrap().get(token_id).copied())
        }

        async fn merge_shares(
            &self,
            condition_id: &str,
            qty: Decimal,
        ) -> Result<String, ClobError> {
            self.merges
                .lock()
                .unwrap()
                .push((condition_id.to_string(), qty));
            Ok(format!("mock-tx-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }
    }
}
