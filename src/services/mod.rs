//! Infrastructure services for the trading bot

pub mod clob_errors;
pub mod discovery;
pub mod gateway;
pub mod notify;
pub mod rate_limiter;
pub mod retry;

pub use clob_errors::ClobError;
pub use discovery::{GammaDiscovery, MarketDiscovery};
pub use gateway::{ClobGateway, ExchangeGateway, ExchangeOrderState, OrderStatusResult};
pub use notify::Notifier;
pub use rate_limiter::{EndpointClass, RateLimiter};
pub use retry::{with_retry, RetryConfig};
