//! Moneyline market discovery against the Polymarket Gamma API
//!
//! A game's market may not exist yet when its job enters the execution
//! window; `fetch_moneyline_for_game` returning `Ok(None)` is the signal
//! the scheduler maps to retry-in-live / skip-in-paper.

use crate::config::GammaApi;
use crate::types::MoneylineMarket;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, warn};

/// Market discovery seam consumed by the scheduler
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    /// Find the tradable moneyline market for a game, if one exists yet.
    async fn fetch_moneyline_for_game(
        &self,
        away: &str,
        home: &str,
        date: &str,
    ) -> Result<Option<MoneylineMarket>>;
}

/// Raw market response from Gamma API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    id: String,
    #[serde(default)]
    condition_id: String,
    question: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    outcomes: Option<String>,
    #[serde(default)]
    outcome_prices: Option<String>,
    #[serde(default)]
    clob_token_ids: Option<String>,
    #[serde(default)]
    game_start_time: Option<String>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

/// Production discovery against the Gamma API
pub struct GammaDiscovery {
    client: Client,
}

impl GammaDiscovery {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Moneyline slugs follow `nba-{away}-{home}-{yyyy-mm-dd}`
    fn game_slug(away: &str, home: &str, date: &str) -> String {
        format!(
            "nba-{}-{}-{}",
            away.to_lowercase(),
            home.to_lowercase(),
            date
        )
    }

    fn parse_market(gm: GammaMarket, away: &str, home: &str) -> Option<MoneylineMarket> {
        if !gm.active || gm.closed {
            return None;
        }

        let outcomes = parse_json_pair(&gm.outcomes)?;
        let prices = parse_price_pair(&gm.outcome_prices)?;
        let tokens = parse_json_pair(&gm.clob_token_ids)?;

        // Outcomes carry team names; match them to away/home rather than
        // trusting positional order
        let away_idx = outcome_index(&outcomes, away).unwrap_or(0);
        let home_idx = 1 - away_idx;
        if outcome_index(&outcomes, home) == Some(away_idx) {
            warn!(
                "Ambiguous outcomes {:?} for {}@{}, using positional order",
                outcomes, away, home
            );
        }

        let game_start_time = gm
            .game_start_time
            .as_ref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Some(MoneylineMarket {
            market_id: gm.id,
            condition_id: gm.condition_id,
            question: gm.question,
            slug: gm.slug,
            away_token_id: tokens[away_idx].clone(),
            home_token_id: tokens[home_idx].clone(),
            away_price: prices[away_idx],
            home_price: prices[home_idx],
            game_start_time,
        })
    }
}

impl Default for GammaDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDiscovery for GammaDiscovery {
    async fn fetch_moneyline_for_game(
        &self,
        away: &str,
        home: &str,
        date: &str,
    ) -> Result<Option<MoneylineMarket>> {
        let slug = Self::game_slug(away, home, date);
        let url = format!(
            "{}?slug={}",
            GammaApi::markets_url(),
            urlencoding::encode(&slug)
        );

        debug!("Fetching moneyline: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch moneyline market")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gamma API error {}: {}", status, body);
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .context("Failed to parse market response")?;

        // Empty result means the market simply doesn't exist yet
        Ok(markets
            .into_iter()
            .find_map(|gm| Self::parse_market(gm, away, home)))
    }
}

/// Parse a Gamma JSON-in-a-string pair like "[\"BOS\", \"LAL\"]"
fn parse_json_pair(s: &Option<String>) -> Option<[String; 2]> {
    let s = s.as_ref()?;
    let items: Vec<String> = serde_json::from_str(s).ok()?;
    if items.len() < 2 {
        return None;
    }
    Some([items[0].clone(), items[1].clone()])
}

/// Prices come as "[\"0.65\", \"0.35\"]" or occasionally as raw numbers
fn parse_price_pair(s: &Option<String>) -> Option<[Decimal; 2]> {
    let s = s.as_ref()?;
    if let Ok(prices) = serde_json::from_str::<Vec<String>>(s) {
        if prices.len() >= 2 {
            let a = Decimal::from_str(&prices[0]).ok()?;
            let b = Decimal::from_str(&prices[1]).ok()?;
            return Some([a, b]);
        }
    }
    if let Ok(prices) = serde_json::from_str::<Vec<f64>>(s) {
        if prices.len() >= 2 {
            let a = Decimal::try_from(prices[0]).ok()?;
            let b = Decimal::try_from(prices[1]).ok()?;
            return Some([a, b]);
        }
    }
    None
}

/// Index of the outcome matching a team name/abbreviation
fn outcome_index(outcomes: &[String; 2], team: &str) -> Option<usize> {
    let team_lower = team.to_lowercase();
    outcomes.iter().position(|o| {
        let o = o.to_lowercase();
        o == team_lower || o.contains(&team_lower) || team_lower.contains(&o)
    })
}

#[cfg(test)]
pub mod mock {
    //! Scriptable discovery for scheduler tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockDiscovery {
        /// Keyed by `{date}-{away}-{home}`
        pub markets: Mutex<HashMap<String, MoneylineMarket>>,
    }

    impl MockDiscovery {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, away: &str, home: &str, date: &str, market: MoneylineMarket) {
            self.markets
                .lock()
                .unwrap()
                .insert(format!("{}-{}-{}", date, away, home), market);
        }
    }

    #[async_trait]
    impl MarketDiscovery for MockDiscovery {
        async fn fetch_moneyline_for_game(
            &self,
            away: &str,
            home: &str,
            date: &str,
        ) -> Result<Option<MoneylineMarket>> {
            Ok(self
                .markets
                .lock()
                .unwrap()
                .get(&format!("{}-{}-{}", date, away, home))
                .cloned())
        }
    }
}
