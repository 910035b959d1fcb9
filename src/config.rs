//! Configuration management for the courtside bot

use crate::types::TradingMode;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Execution mode (live / paper / dry-run)
    pub mode: TradingMode,

    /// Path to SQLite database
    pub database_path: String,

    /// Bankroll used for Kelly sizing, in USDC
    pub bankroll_usd: f64,

    /// External de-risking lever in [0, 1]; 0 disables all new sizing
    pub regime_multiplier: f64,

    /// Seconds between scheduler/order-manager passes in `run` mode
    pub tick_interval_seconds: u64,

    /// Discord webhook URL for fill/replace/expiry alerts (optional)
    pub discord_webhook_url: Option<String>,

    /// CLOB API access
    pub clob: ClobApiConfig,

    /// Position sizing settings
    pub sizing: SizingConfig,

    /// Order lifecycle settings
    pub orders: OrderLifecycleConfig,

    /// Hedge leg settings
    pub hedge: HedgeConfig,

    /// DCA entry settings
    pub dca: DcaConfig,
}

/// Credentials and endpoint for the Polymarket CLOB
#[derive(Debug, Clone)]
pub struct ClobApiConfig {
    pub endpoint: String,
    pub wallet_address: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

impl ClobApiConfig {
    /// All four credential pieces present
    pub fn has_credentials(&self) -> bool {
        self.wallet_address.is_some()
            && self.api_key.is_some()
            && self.api_secret.is_some()
            && self.api_passphrase.is_some()
    }
}

/// Sizing engine settings
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Fraction of full Kelly to use (default: 0.25)
    pub kelly_base_fraction: f64,
    /// Hard cap per position in USD
    pub max_position_usd: f64,
    /// Hard cap on total capital committed to one game in USD
    pub max_game_risk_usd: f64,
    /// Capital budget for mergeable matched-pair inventory in USD
    pub merge_capital_usd: f64,
    /// Expected merge settlement fee in USD
    pub expected_merge_fee_usd: f64,
    /// Expected gas cost of a merge transaction in USD
    pub expected_merge_gas_usd: f64,
    /// Share count used to amortize fee+gas when computing the merge edge
    pub assumed_merge_shares: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_base_fraction: 0.25,
            max_position_usd: 100.0,
            max_game_risk_usd: 250.0,
            merge_capital_usd: 150.0,
            expected_merge_fee_usd: 0.0,
            expected_merge_gas_usd: 0.05,
            assumed_merge_shares: 100.0,
        }
    }
}

/// Order lifecycle manager settings
#[derive(Debug, Clone)]
pub struct OrderLifecycleConfig {
    /// Seconds before a resting order is reconsidered for re-pricing
    pub order_ttl_secs: i64,
    /// Hard cap on re-pricing attempts per order
    pub order_max_replaces: u32,
    /// Minimum ask move before a replace is worth it (noise filter)
    pub min_price_move: Decimal,
    /// Maximum orders checked per tick
    pub max_orders_per_tick: usize,
    /// Sleep between exchange calls within one tick, in milliseconds
    pub check_spacing_ms: u64,
    /// Price tick the replacement bid is shaved by
    pub price_tick: Decimal,
    /// Placement retries before a job is marked failed
    pub max_job_retries: u32,
}

impl Default for OrderLifecycleConfig {
    fn default() -> Self {
        Self {
            order_ttl_secs: 90,
            order_max_replaces: 5,
            min_price_move: Decimal::new(1, 2), // 0.01
            max_orders_per_tick: 25,
            check_spacing_ms: 250,
            price_tick: Decimal::new(1, 2), // 0.01
            max_job_retries: 3,
        }
    }
}

/// Hedge leg settings
#[derive(Debug, Clone)]
pub struct HedgeConfig {
    /// Hedge-to-directional capital ratio published by the optimizer
    pub hedge_ratio: f64,
    /// Ceiling on directional_vwap + hedge price; above it the pair
    /// no longer carries a merge edge
    pub combined_price_ceiling: Decimal,
    /// Grid search bounds and step for the optimizer
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub ratio_step: f64,
    /// Drawdown penalty weight in the optimizer objective
    pub dd_penalty: f64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: 0.5,
            combined_price_ceiling: Decimal::new(99, 2), // 0.99
            min_ratio: 0.3,
            max_ratio: 0.8,
            ratio_step: 0.05,
            dd_penalty: 0.5,
        }
    }
}

/// DCA entry settings
#[derive(Debug, Clone)]
pub struct DcaConfig {
    /// Entries a directional position is split into (1 = no DCA)
    pub default_max_entries: u32,
    /// Smallest slice worth placing, in USD
    pub min_slice_usd: f64,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            default_max_entries: 3,
            min_slice_usd: 5.0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let mode = env::var("TRADING_MODE")
            .ok()
            .map(|v| v.parse::<TradingMode>())
            .transpose()?
            .unwrap_or(TradingMode::Paper); // Default to paper for safety

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "courtside.db".to_string());

        let bankroll_usd = env::var("BANKROLL_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000.0);

        let regime_multiplier = env::var("REGIME_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        let tick_interval_seconds = env::var("TICK_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let discord_webhook_url = env::var("DISCORD_WEBHOOK_URL").ok().filter(|s| !s.is_empty());

        let clob = ClobApiConfig {
            endpoint: env::var("CLOB_ENDPOINT")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),
            wallet_address: env::var("CLOB_WALLET_ADDRESS").ok().filter(|s| !s.is_empty()),
            api_key: env::var("CLOB_API_KEY").ok().filter(|s| !s.is_empty()),
            api_secret: env::var("CLOB_API_SECRET").ok().filter(|s| !s.is_empty()),
            api_passphrase: env::var("CLOB_API_PASSPHRASE").ok().filter(|s| !s.is_empty()),
        };

        let mut sizing = SizingConfig::default();
        if let Some(v) = env::var("KELLY_BASE_FRACTION").ok().and_then(|v| v.parse().ok()) {
            sizing.kelly_base_fraction = v;
        }
        if let Some(v) = env::var("MAX_POSITION_USD").ok().and_then(|v| v.parse().ok()) {
            sizing.max_position_usd = v;
        }
        if let Some(v) = env::var("MAX_GAME_RISK_USD").ok().and_then(|v| v.parse().ok()) {
            sizing.max_game_risk_usd = v;
        }
        if let Some(v) = env::var("MERGE_CAPITAL_USD").ok().and_then(|v| v.parse().ok()) {
            sizing.merge_capital_usd = v;
        }
        if let Some(v) = env::var("EXPECTED_MERGE_GAS_USD").ok().and_then(|v| v.parse().ok()) {
            sizing.expected_merge_gas_usd = v;
        }

        let mut orders = OrderLifecycleConfig::default();
        if let Some(v) = env::var("ORDER_TTL_SECS").ok().and_then(|v| v.parse().ok()) {
            orders.order_ttl_secs = v;
        }
        if let Some(v) = env::var("ORDER_MAX_REPLACES").ok().and_then(|v| v.parse().ok()) {
            orders.order_max_replaces = v;
        }
        if let Some(v) = env::var("MIN_PRICE_MOVE").ok().and_then(|v| Decimal::from_str(&v).ok()) {
            orders.min_price_move = v;
        }
        if let Some(v) = env::var("MAX_ORDERS_PER_TICK").ok().and_then(|v| v.parse().ok()) {
            orders.max_orders_per_tick = v;
        }

        let mut hedge = HedgeConfig::default();
        if let Some(v) = env::var("HEDGE_RATIO").ok().and_then(|v| v.parse().ok()) {
            hedge.hedge_ratio = v;
        }
        if let Some(v) = env::var("COMBINED_PRICE_CEILING")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
        {
            hedge.combined_price_ceiling = v;
        }

        let mut dca = DcaConfig::default();
        if let Some(v) = env::var("DCA_MAX_ENTRIES").ok().and_then(|v| v.parse().ok()) {
            dca.default_max_entries = v;
        }

        // Validate configuration
        if mode.is_live() && !clob.has_credentials() {
            anyhow::bail!(
                "CLOB_WALLET_ADDRESS, CLOB_API_KEY, CLOB_API_SECRET and CLOB_API_PASSPHRASE \
                 are required for live trading"
            );
        }

        Ok(Self {
            mode,
            database_path,
            bankroll_usd,
            regime_multiplier,
            tick_interval_seconds,
            discord_webhook_url,
            clob,
            sizing,
            orders,
            hedge,
            dca,
        })
    }
}

/// Gamma API configuration
pub struct GammaApi;

impl GammaApi {
    pub const BASE_URL: &'static str = "https://gamma-api.polymarket.com";

    pub fn markets_url() -> String {
        format!("{}/markets", Self::BASE_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let orders = OrderLifecycleConfig::default();
        assert!(orders.order_ttl_secs > 0);
        assert!(orders.order_max_replaces > 0);
        assert!(orders.min_price_move > Decimal::ZERO);

        let sizing = SizingConfig::default();
        assert!(sizing.kelly_base_fraction > 0.0 && sizing.kelly_base_fraction <= 1.0);
        assert!(sizing.max_position_usd <= sizing.max_game_risk_usd);

        let hedge = HedgeConfig::default();
        assert!(hedge.min_ratio < hedge.max_ratio);
        assert!(hedge.ratio_step > 0.0);
    }
}
