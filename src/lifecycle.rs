//! Order lifecycle manager - per-tick polling, fill detection, TTL
//! enforcement and price-chasing replacement of resting orders
//!
//! Each tick walks the outstanding placed orders oldest-first, bounded by
//! `max_orders_per_tick`, with an explicit sleep between exchange calls.
//! Every branch stamps `order_last_checked_at` so a crash mid-tick resumes
//! cleanly from persisted state.

use crate::config::OrderLifecycleConfig;
use crate::db::Database;
use crate::ledger::PositionGroupLedger;
use crate::services::{ExchangeGateway, ExchangeOrderState, Notifier};
use crate::types::{JobSide, OrderEventKind, OrderState, Signal};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one order check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCheckOutcome {
    /// Order filled at the exchange
    Filled,
    /// Order cancelled/expired at the exchange
    Cancelled,
    /// No action taken this tick
    Kept,
    /// Deliberately stopped: tip-off, TTL replace budget, or hedge ceiling
    Expired,
    /// Cancel-and-replace happened
    Replaced { new_order_id: String },
}

/// Summary counts for one pass
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    pub checked: usize,
    pub filled: usize,
    pub cancelled: usize,
    pub kept: usize,
    pub expired: usize,
    pub replaced: usize,
    pub errors: usize,
}

/// Order lifecycle manager
pub struct OrderLifecycleManager {
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<PositionGroupLedger>,
    notifier: Notifier,
    config: OrderLifecycleConfig,
    /// Ceiling on directional_vwap + hedge price before a replace is refused
    combined_price_ceiling: Decimal,
}

impl OrderLifecycleManager {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<PositionGroupLedger>,
        notifier: Notifier,
        config: OrderLifecycleConfig,
        combined_price_ceiling: Decimal,
    ) -> Self {
        Self {
            db,
            gateway,
            ledger,
            notifier,
            config,
            combined_price_ceiling,
        }
    }

    /// Check every outstanding placed order, oldest first. One bad order
    /// never aborts the batch.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let signals = self.db.get_placed_signals(self.config.max_orders_per_tick).await?;
        let mut summary = PassSummary::default();

        for (i, signal) in signals.iter().enumerate() {
            if i > 0 && self.config.check_spacing_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.check_spacing_ms))
                    .await;
            }

            summary.checked += 1;
            match self.check_single_order(signal, now).await {
                Ok(OrderCheckOutcome::Filled) => summary.filled += 1,
                Ok(OrderCheckOutcome::Cancelled) => summary.cancelled += 1,
                Ok(OrderCheckOutcome::Kept) => summary.kept += 1,
                Ok(OrderCheckOutcome::Expired) => summary.expired += 1,
                Ok(OrderCheckOutcome::Replaced { .. }) => summary.replaced += 1,
                Err(e) => {
                    warn!("Order check failed for signal {}: {:#}", signal.id, e);
                    summary.errors += 1;
                }
            }
        }

        if summary.checked > 0 {
            info!(
                "Order pass: {} checked, {} filled, {} replaced, {} expired, {} kept, {} errors",
                summary.checked,
                summary.filled,
                summary.replaced,
                summary.expired,
                summary.kept,
                summary.errors
            );
        }
        Ok(summary)
    }

    /// Run the full decision ladder for one resting order.
    pub async fn check_single_order(
        &self,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<OrderCheckOutcome> {
        let order_id = signal
            .order_id
            .as_deref()
            .context("placed signal has no order id")?;

        // Stamped first so a crash later in the ladder still leaves the
        // check recorded
        self.db.touch_signal_checked(signal.id, now).await?;

        // 1. What does the exchange say?
        let status = self
            .gateway
            .get_order_status(order_id)
            .await
            .map_err(|e| anyhow::anyhow!("get_order_status: {}", e))?;

        match status.state {
            ExchangeOrderState::Filled => {
                // Exchange sometimes omits the trade price; the intended
                // price is the conservative stand-in
                let fill_price = status.fill_price.unwrap_or(signal.target_price);
                let filled_shares = if status.size_matched.is_zero() {
                    signal.shares
                } else {
                    status.size_matched
                };
                self.db
                    .mark_signal_filled(signal.id, fill_price, filled_shares)
                    .await?;
                self.db
                    .insert_order_event(signal.id, OrderEventKind::Filled, Some(fill_price), None)
                    .await?;
                self.ledger.record_fill(signal, filled_shares).await?;
                self.notifier.order_filled(signal, fill_price, filled_shares).await;
                info!(
                    "Signal {} filled: {} shares at {}",
                    signal.id, filled_shares, fill_price
                );
                return Ok(OrderCheckOutcome::Filled);
            }
            ExchangeOrderState::Cancelled => {
                self.db
                    .mark_signal_terminal(signal.id, OrderState::Cancelled)
                    .await?;
                self.db
                    .insert_order_event(signal.id, OrderEventKind::Cancelled, None, None)
                    .await?;
                info!("Signal {} cancelled at exchange", signal.id);
                return Ok(OrderCheckOutcome::Cancelled);
            }
            ExchangeOrderState::Open | ExchangeOrderState::PartiallyFilled => {}
        }

        // 2. Young orders rest untouched; this bounds re-pricing frequency
        if signal.order_age_secs(now) < self.config.order_ttl_secs {
            return Ok(OrderCheckOutcome::Kept);
        }

        let job = self.db.get_job(signal.job_id).await?;

        // 3. Tip-off is a hard stop regardless of replace budget
        if now >= job.game_time {
            return self
                .expire_order(signal, order_id, "game tipped off")
                .await;
        }

        // 4. Replace budget exhausted is a deliberate stop, not a failure
        if signal.order_replace_count >= self.config.order_max_replaces {
            return self
                .expire_order(signal, order_id, "replace budget exhausted")
                .await;
        }

        // 5. Re-price only on a real move
        let Some(best_ask) = self
            .gateway
            .get_best_ask(&signal.token_id)
            .await
            .map_err(|e| anyhow::anyhow!("get_best_ask: {}", e))?
        else {
            return Ok(OrderCheckOutcome::Kept);
        };

        let resting_price = signal.order_original_price.unwrap_or(signal.target_price);
        let move_size = (best_ask - resting_price).abs();
        if move_size < self.config.min_price_move {
            return Ok(OrderCheckOutcome::Kept);
        }

        let new_price = (best_ask - self.config.price_tick).max(self.config.price_tick);

        // 6. A hedge leg must not chase the ask past the point where the
        // pair stops clearing the merge edge
        if signal.signal_role == JobSide::Hedge {
            if let Some(group_id) = signal.bothside_group_id.as_deref() {
                if let Some(dir_vwap) = self.db.directional_vwap(group_id).await? {
                    if dir_vwap + new_price > self.combined_price_ceiling {
                        debug!(
                            "Hedge signal {}: vwap {} + new price {} breaches ceiling {}",
                            signal.id, dir_vwap, new_price, self.combined_price_ceiling
                        );
                        return self
                            .expire_order(signal, order_id, "combined price ceiling")
                            .await;
                    }
                }
            }
        }

        // 7. Chase: cancel-and-replace one tick under the ask
        let new_order_id = self
            .gateway
            .cancel_and_replace_order(order_id, &signal.token_id, new_price, signal.shares)
            .await
            .map_err(|e| anyhow::anyhow!("cancel_and_replace: {}", e))?;

        self.db
            .insert_order_event(
                signal.id,
                OrderEventKind::Cancelled,
                Some(resting_price),
                Some(best_ask),
            )
            .await?;
        self.db
            .apply_signal_replacement(signal.id, &new_order_id, new_price, now)
            .await?;
        self.db
            .insert_order_event(signal.id, OrderEventKind::Placed, Some(new_price), Some(best_ask))
            .await?;
        self.notifier
            .order_replaced(signal, resting_price, new_price, signal.order_replace_count + 1)
            .await;

        info!(
            "Signal {} re-priced {} -> {} (ask {}, replace #{})",
            signal.id,
            resting_price,
            new_price,
            best_ask,
            signal.order_replace_count + 1
        );
        Ok(OrderCheckOutcome::Replaced { new_order_id })
    }

    /// Cancel at the exchange and mark the signal expired.
    async fn expire_order(
        &self,
        signal: &Signal,
        order_id: &str,
        reason: &str,
    ) -> Result<OrderCheckOutcome> {
        if let Err(e) = self.gateway.cancel_order(order_id).await {
            warn!(
                "Cancel failed while expiring signal {} ({}): {}",
                signal.id, reason, e
            );
        }
        self.db
            .mark_signal_terminal(signal.id, OrderState::Expired)
            .await?;
        self.db
            .insert_order_event(signal.id, OrderEventKind::Expired, None, None)
            .await?;
        self.notifier.order_expired(signal, reason).await;
        info!("Signal {} expired: {}", signal.id, reason);
        Ok(OrderCheckOutcome::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingConfig;
    use crate::db::{NewSignal, NewTradeJob};
    use crate::services::gateway::mock::MockGateway;
    use crate::types::{Confidence, TeamSide};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Arc<Database>,
        gateway: Arc<MockGateway>,
        manager: OrderLifecycleManager,
        now: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let gateway = Arc::new(MockGateway::new());
        let ledger = Arc::new(PositionGroupLedger::new(
            db.clone(),
            Notifier::disabled(),
            SizingConfig::default(),
        ));
        let config = OrderLifecycleConfig {
            order_ttl_secs: 60,
            order_max_replaces: 3,
            min_price_move: dec!(0.01),
            max_orders_per_tick: 25,
            check_spacing_ms: 0,
            price_tick: dec!(0.01),
            max_job_retries: 3,
        };
        let manager = OrderLifecycleManager::new(
            db.clone(),
            gateway.clone(),
            ledger,
            Notifier::disabled(),
            config,
            dec!(0.99),
        );
        Fixture {
            db,
            gateway,
            manager,
            now: Utc::now(),
        }
    }

    /// Place a directional or hedge order resting since `age_secs` ago
    async fn place_order(
        fx: &Fixture,
        game_id: &str,
        role: JobSide,
        price: Decimal,
        age_secs: i64,
        group: Option<&str>,
    ) -> Signal {
        let db = &fx.db;
        let job_id = db
            .create_job(&NewTradeJob {
                game_id: game_id.to_string(),
                away_team: "BOS".to_string(),
                home_team: "LAL".to_string(),
                game_date: "2026-04-07".to_string(),
                backed_side: TeamSide::Away,
                p_low: 0.62,
                confidence: Confidence::High,
                game_time: fx.now + Duration::hours(4),
                execute_after: fx.now - Duration::hours(1),
                execute_before: fx.now + Duration::hours(3),
                job_side: role,
                paired_job_id: match role {
                    JobSide::Directional => None,
                    JobSide::Hedge => {
                        Some(db.get_directional_job(game_id).await.unwrap().unwrap().id)
                    }
                },
                bothside_group_id: group.map(|s| s.to_string()),
                dca_group_id: None,
                dca_max_entries: 1,
                dca_slice_usd: None,
            })
            .await
            .unwrap();

        let sig_id = db
            .create_signal(&NewSignal {
                job_id,
                game_id: game_id.to_string(),
                token_id: format!("tok-{}", game_id),
                condition_id: "0xcond".to_string(),
                target_price: price,
                kelly_size_usd: price * dec!(40),
                shares: dec!(40),
                dca_seq: 0,
                bothside_group_id: group.map(|s| s.to_string()),
                signal_role: role,
            })
            .await
            .unwrap();

        let order_id = fx
            .gateway
            .place_limit_order(&format!("tok-{}", game_id), price, dec!(40))
            .await
            .unwrap();
        db.mark_signal_placed(sig_id, &order_id, price, fx.now - Duration::seconds(age_secs))
            .await
            .unwrap();
        db.get_signal(sig_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_young_order_is_kept() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 10, None).await;
        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Kept);

        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert!(signal.order_last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_order_with_moved_ask_is_replaced() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, None).await;
        fx.gateway.script_best_ask("tok-g1", dec!(0.65));

        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        let OrderCheckOutcome::Replaced { new_order_id } = outcome else {
            panic!("expected replace, got {:?}", outcome);
        };
        assert!(!new_order_id.is_empty());

        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.order_replace_count, 1);
        assert_eq!(signal.order_id.as_deref(), Some(new_order_id.as_str()));
        // New resting price is one tick under the ask
        assert_eq!(signal.order_original_price, Some(dec!(0.64)));

        // Both legs of the swap were audited
        let events = fx.db.get_order_events(signal.id).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(kinds, vec!["cancelled", "placed"]);
    }

    #[tokio::test]
    async fn test_kept_is_idempotent_with_unchanged_ask() {
        let fx = fixture().await;
        // Stale, but the ask hasn't moved beyond the noise threshold
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, None).await;
        fx.gateway.script_best_ask("tok-g1", dec!(0.605));

        let first = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(first, OrderCheckOutcome::Kept);
        let signal = fx.db.get_signal(signal.id).await.unwrap();
        let second = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(second, OrderCheckOutcome::Kept);
        let after = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(after.order_replace_count, 0);
        assert_eq!(after.order_status, OrderState::Placed);
    }

    #[tokio::test]
    async fn test_no_best_ask_keeps_order() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, None).await;
        // No ask scripted: book unavailable
        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Kept);
    }

    #[tokio::test]
    async fn test_replace_budget_exhausted_expires() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, None).await;
        for _ in 0..3 {
            fx.db
                .apply_signal_replacement(signal.id, "replaced", dec!(0.61), fx.now - Duration::seconds(120))
                .await
                .unwrap();
        }
        fx.gateway
            .script_status("replaced", ExchangeOrderState::Open, None, Decimal::ZERO);
        fx.gateway.script_best_ask("tok-g1", dec!(0.70));

        let signal = fx.db.get_signal(signal.id).await.unwrap();
        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Expired);
        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.order_status, OrderState::Expired);
    }

    #[tokio::test]
    async fn test_tip_off_expires_despite_replace_budget() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, None).await;
        fx.gateway.script_best_ask("tok-g1", dec!(0.70));

        // Five hours from now the game is underway
        let late = fx.now + Duration::hours(5);
        let outcome = fx.manager.check_single_order(&signal, late).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Expired);
    }

    #[tokio::test]
    async fn test_hedge_ceiling_breach_expires_not_replaces() {
        let fx = fixture().await;
        // Directional leg filled at 0.60 under group bg1
        let dir = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 120, Some("bg1")).await;
        fx.db
            .mark_signal_filled(dir.id, dec!(0.60), dec!(40))
            .await
            .unwrap();

        // Hedge resting; ask has run away so the replacement would price
        // the pair over the ceiling (0.60 + 0.44 > 0.99)
        let hedge = place_order(&fx, "g1", JobSide::Hedge, dec!(0.35), 120, Some("bg1")).await;
        fx.gateway.script_best_ask("tok-g1", dec!(0.45));

        let outcome = fx.manager.check_single_order(&hedge, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Expired);
        let hedge = fx.db.get_signal(hedge.id).await.unwrap();
        assert_eq!(hedge.order_status, OrderState::Expired);
        assert_eq!(hedge.order_replace_count, 0);
    }

    #[tokio::test]
    async fn test_hedge_under_ceiling_still_replaces() {
        let fx = fixture().await;
        let dir = place_order(&fx, "g1", JobSide::Directional, dec!(0.55), 120, Some("bg1")).await;
        fx.db
            .mark_signal_filled(dir.id, dec!(0.55), dec!(40))
            .await
            .unwrap();

        let hedge = place_order(&fx, "g1", JobSide::Hedge, dec!(0.35), 120, Some("bg1")).await;
        // 0.55 + 0.39 = 0.94 stays under the 0.99 ceiling
        fx.gateway.script_best_ask("tok-g1", dec!(0.40));

        let outcome = fx.manager.check_single_order(&hedge, fx.now).await.unwrap();
        assert!(matches!(outcome, OrderCheckOutcome::Replaced { .. }));
    }

    #[tokio::test]
    async fn test_filled_at_exchange_records_fill_and_ledger() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 10, None).await;
        fx.gateway.script_status(
            signal.order_id.as_deref().unwrap(),
            ExchangeOrderState::Filled,
            Some(dec!(0.59)),
            dec!(40),
        );

        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Filled);

        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.order_status, OrderState::Filled);
        assert_eq!(signal.fill_price, Some(dec!(0.59)));

        let group = fx.db.get_group_by_game("g1").await.unwrap().unwrap();
        assert_eq!(group.q_dir, dec!(40));
    }

    #[tokio::test]
    async fn test_fill_without_price_falls_back_to_target() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 10, None).await;
        fx.gateway.script_status(
            signal.order_id.as_deref().unwrap(),
            ExchangeOrderState::Filled,
            None,
            dec!(40),
        );

        fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.fill_price, Some(dec!(0.60)));
    }

    #[tokio::test]
    async fn test_cancelled_at_exchange() {
        let fx = fixture().await;
        let signal = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 10, None).await;
        fx.gateway.script_status(
            signal.order_id.as_deref().unwrap(),
            ExchangeOrderState::Cancelled,
            None,
            Decimal::ZERO,
        );

        let outcome = fx.manager.check_single_order(&signal, fx.now).await.unwrap();
        assert_eq!(outcome, OrderCheckOutcome::Cancelled);
        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.order_status, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_run_pass_counts() {
        let fx = fixture().await;
        let a = place_order(&fx, "g1", JobSide::Directional, dec!(0.60), 10, None).await;
        let _b = place_order(&fx, "g2", JobSide::Directional, dec!(0.55), 10, None).await;
        fx.gateway.script_status(
            a.order_id.as_deref().unwrap(),
            ExchangeOrderState::Filled,
            Some(dec!(0.60)),
            dec!(40),
        );

        let summary = fx.manager.run_pass(fx.now).await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.filled, 1);
        assert_eq!(summary.kept, 1);
        assert_eq!(summary.errors, 0);
    }
}
