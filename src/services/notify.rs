//! Discord webhook notifications for order and merge events
//!
//! Delivery is best-effort: a failed webhook is logged and never bubbles
//! into the state transition that triggered it.

use crate::types::{JobSide, Signal};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info};

/// Discord webhook client for lifecycle alerts
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    /// Disabled notifier for tests and dry runs
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub async fn order_filled(&self, signal: &Signal, fill_price: Decimal, shares: Decimal) {
        let role = match signal.signal_role {
            JobSide::Directional => "Directional",
            JobSide::Hedge => "Hedge",
        };
        self.send_embed(
            &format!("✅ {} fill — {}", role, signal.game_id),
            0x00FF00,
            vec![
                ("Price", format!("{}¢", fill_price * Decimal::from(100))),
                ("Shares", shares.to_string()),
                ("DCA slice", format!("{}", signal.dca_seq + 1)),
            ],
        )
        .await;
    }

    pub async fn order_replaced(
        &self,
        signal: &Signal,
        old_price: Decimal,
        new_price: Decimal,
        replace_count: u32,
    ) {
        self.send_embed(
            &format!("♻️ Order re-priced — {}", signal.game_id),
            0xFFA500,
            vec![
                ("Old", format!("{}¢", old_price * Decimal::from(100))),
                ("New", format!("{}¢", new_price * Decimal::from(100))),
                ("Replace", format!("#{}", replace_count)),
            ],
        )
        .await;
    }

    pub async fn order_expired(&self, signal: &Signal, reason: &str) {
        self.send_embed(
            &format!("⏱️ Order expired — {}", signal.game_id),
            0x808080,
            vec![
                ("Reason", reason.to_string()),
                ("Target", format!("{}¢", signal.target_price * Decimal::from(100))),
            ],
        )
        .await;
    }

    pub async fn merge_executed(&self, game_id: &str, qty: Decimal, recovery_usd: Decimal) {
        self.send_embed(
            &format!("💰 Merge settled — {}", game_id),
            0x00BFFF,
            vec![
                ("Pairs merged", qty.to_string()),
                ("Recovered", format!("${}", recovery_usd)),
            ],
        )
        .await;
    }

    pub async fn imbalance_violation(&self, game_id: &str, d: Decimal, d_max: Decimal) {
        self.send_embed(
            &format!("⚠️ Imbalance breach — {}", game_id),
            0xFF0000,
            vec![
                ("d", d.to_string()),
                ("d_max", d_max.to_string()),
            ],
        )
        .await;
    }

    pub async fn job_failed(&self, game_id: &str, side: JobSide, error: &str) {
        self.send_embed(
            &format!("🛑 Job failed — {} ({})", game_id, side),
            0xFF0000,
            vec![("Error", error.to_string())],
        )
        .await;
    }

    async fn send_embed(&self, title: &str, color: u32, fields: Vec<(&str, String)>) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let embed = json!({
            "embeds": [{
                "title": title,
                "color": color,
                "fields": fields
                    .iter()
                    .map(|(name, value)| json!({
                        "name": name,
                        "value": value,
                        "inline": true
                    }))
                    .collect::<Vec<_>>(),
                "footer": { "text": "courtside-bot" },
                "timestamp": chrono::Utc::now().to_rfc3339()
            }]
        });

        match self.client.post(url).json(&embed).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Discord alert sent: {}", title);
                } else {
                    error!("Discord webhook failed: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send Discord webhook: {}", e);
            }
        }
    }
}
