//! CLOB API error differentiation
//!
//! Parses CLOB error responses into a structured taxonomy so the gateway
//! can decide what is retryable within a tick and what must surface as a
//! durable job/signal error.

use serde::Deserialize;
use thiserror::Error;

/// Structured CLOB API error types
#[derive(Debug, Clone, Error)]
pub enum ClobError {
    #[error("insufficient USDC balance")]
    InsufficientBalance,
    #[error("price moved beyond acceptable range")]
    PriceMoved,
    #[error("order size below minimum")]
    OrderSizeTooSmall,
    #[error("price not on a valid tick boundary")]
    InvalidTickSize,
    #[error("rate limited by CLOB API")]
    RateLimited,
    #[error("market closed or not accepting orders")]
    MarketClosed,
    #[error("order not found")]
    OrderNotFound,
    #[error("API authentication failed")]
    AuthenticationFailed,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("CLOB API error {status}: {body}")]
    Unknown { status: u16, body: String },
}

/// CLOB API error response format
#[derive(Debug, Deserialize)]
struct ClobErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ClobError {
    /// Parse a CLOB API response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let error_msg = if let Ok(parsed) = serde_json::from_str::<ClobErrorResponse>(body) {
            parsed.error.or(parsed.message).unwrap_or_default()
        } else {
            body.to_string()
        };

        let msg_lower = error_msg.to_lowercase();

        if status == 429 || msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
            return ClobError::RateLimited;
        }

        if status == 404 || msg_lower.contains("not found") {
            return ClobError::OrderNotFound;
        }

        if status == 401 || status == 403 || msg_lower.contains("unauthorized")
            || msg_lower.contains("forbidden") || msg_lower.contains("invalid api key")
            || msg_lower.contains("invalid signature")
        {
            return ClobError::AuthenticationFailed;
        }

        if msg_lower.contains("insufficient") || msg_lower.contains("not enough") || msg_lower.contains("balance") {
            return ClobError::InsufficientBalance;
        }

        if msg_lower.contains("price")
            && (msg_lower.contains("moved") || msg_lower.contains("changed") || msg_lower.contains("stale"))
        {
            return ClobError::PriceMoved;
        }

        if msg_lower.contains("size")
            && (msg_lower.contains("small") || msg_lower.contains("minimum") || msg_lower.contains("below"))
        {
            return ClobError::OrderSizeTooSmall;
        }

        if msg_lower.contains("tick") || (msg_lower.contains("price") && msg_lower.contains("invalid")) {
            return ClobError::InvalidTickSize;
        }

        if msg_lower.contains("closed")
            || msg_lower.contains("not accepting")
            || msg_lower.contains("market") && msg_lower.contains("inactive")
        {
            return ClobError::MarketClosed;
        }

        ClobError::Unknown {
            status,
            body: error_msg,
        }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ClobError::NetworkError("Request timed out".to_string())
        } else if err.is_connect() {
            ClobError::NetworkError("Connection failed".to_string())
        } else {
            ClobError::NetworkError(err.to_string())
        }
    }

    /// Whether this error is retryable with exponential backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClobError::RateLimited | ClobError::NetworkError(_) | ClobError::PriceMoved
        )
    }
}
