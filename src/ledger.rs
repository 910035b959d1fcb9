//! Position group ledger - per-game inventory, imbalance auditing and
//! merge-arbitrage accounting
//!
//! The ledger owns position_groups, their audit trail, and the merge
//! accounting fields on signals. It never touches job state; the scheduler
//! reacts to what the ledger reports.

use crate::config::SizingConfig;
use crate::db::Database;
use crate::services::{ClobError, ExchangeGateway, Notifier};
use crate::types::{GroupState, JobSide, PositionGroup, Signal};
use anyhow::{Context, Result};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Merge attempts per group before giving up
const MERGE_MAX_ATTEMPTS: u32 = 5;

/// Result of a merge attempt on one group
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Nothing to merge or edge is gone
    NotEligible,
    /// Pairs merged; carries quantity and recovered USD
    Merged { qty: Decimal, recovery_usd: Decimal },
    /// Attempt failed, will retry next tick
    AttemptFailed,
    /// Retry budget exhausted
    GaveUp,
}

/// Position group ledger
pub struct PositionGroupLedger {
    db: Arc<Database>,
    notifier: Notifier,
    sizing: SizingConfig,
    /// Merge attempts this process lifetime, keyed by group id
    merge_attempts: Mutex<HashMap<i64, u32>>,
}

impl PositionGroupLedger {
    pub fn new(db: Arc<Database>, notifier: Notifier, sizing: SizingConfig) -> Self {
        Self {
            db,
            notifier,
            sizing,
            merge_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Create the group for a game if it doesn't exist yet. Called on the
    /// first directional signal; targets and d_max are fixed at creation.
    pub async fn ensure_group(
        &self,
        game_id: &str,
        m_target: Decimal,
        d_target: Decimal,
        d_max: Decimal,
    ) -> Result<PositionGroup> {
        if let Some(group) = self.db.get_group_by_game(game_id).await? {
            return Ok(group);
        }
        let id = self.db.create_group(game_id, m_target, d_target, d_max).await?;
        let group = self.db.get_group(id).await?;
        self.db
            .insert_group_audit(
                id,
                "created",
                "none",
                GroupState::Open.as_str(),
                Decimal::ZERO,
                Decimal::ZERO,
                d_max,
                None,
            )
            .await?;
        info!(
            "PositionGroup created for {}: M*={} D*={} d_max={}",
            game_id, m_target, d_target, d_max
        );
        Ok(group)
    }

    /// Record a fill against the game's group. Recomputes the imbalance and
    /// records a violation audit event when d exceeds d_max; the breach is
    /// surfaced, never corrected here.
    pub async fn record_fill(&self, signal: &Signal, shares: Decimal) -> Result<()> {
        let group = match self.db.get_group_by_game(&signal.game_id).await? {
            Some(g) => g,
            // Hedge fill arriving before any directional group exists is
            // inventory we must still track
            None => {
                self.ensure_group(&signal.game_id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
                    .await?
            }
        };

        let (q_dir, q_opp) = match signal.signal_role {
            JobSide::Directional => (group.q_dir + shares, group.q_opp),
            JobSide::Hedge => (group.q_dir, group.q_opp + shares),
        };

        self.db
            .update_group_quantities(group.id, q_dir, q_opp, group.merged_qty)
            .await?;

        let d = q_dir - q_opp;
        let m = q_dir.min(q_opp);
        self.db
            .insert_group_audit(
                group.id,
                "fill",
                group.state.as_str(),
                group.state.as_str(),
                d,
                m,
                group.d_max,
                None,
            )
            .await?;

        if d > group.d_max {
            warn!(
                "Imbalance violation on {}: d={} exceeds d_max={}",
                signal.game_id, d, group.d_max
            );
            self.db
                .insert_group_audit(
                    group.id,
                    "imbalance_violation",
                    group.state.as_str(),
                    group.state.as_str(),
                    d,
                    m,
                    group.d_max,
                    None,
                )
                .await?;
            self.notifier
                .imbalance_violation(&signal.game_id, d, group.d_max)
                .await;
        }

        debug!(
            "Group {} after {} fill: q_dir={} q_opp={} d={}",
            signal.game_id, signal.signal_role, q_dir, q_opp, d
        );
        Ok(())
    }

    /// Whether the group currently qualifies for a MERGE: opposite-side
    /// inventory exists and the locked-in pair cost still clears costs.
    pub fn merge_edge(&self, dir_vwap: Decimal, opp_vwap: Decimal, qty: Decimal) -> Decimal {
        if qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let costs = Decimal::from_f64(
            self.sizing.expected_merge_fee_usd + self.sizing.expected_merge_gas_usd,
        )
        .unwrap_or(Decimal::ZERO);
        Decimal::ONE - (dir_vwap + opp_vwap) - costs / qty
    }

    /// Attempt to merge one group's matched pairs. Accounting happens only
    /// after the settlement call succeeds.
    pub async fn try_merge(
        &self,
        group: &PositionGroup,
        gateway: &dyn ExchangeGateway,
    ) -> Result<MergeOutcome> {
        let qty = group.mergeable_qty();
        if qty <= Decimal::ZERO || group.q_opp <= Decimal::ZERO {
            return Ok(MergeOutcome::NotEligible);
        }

        let signals = self.db.get_filled_signals_for_game(&group.game_id).await?;
        let (dir_vwap, opp_vwap) = role_vwaps(&signals);
        let (Some(dir_vwap), Some(opp_vwap)) = (dir_vwap, opp_vwap) else {
            return Ok(MergeOutcome::NotEligible);
        };

        let edge = self.merge_edge(dir_vwap, opp_vwap, qty);
        if edge <= Decimal::ZERO {
            debug!(
                "Merge edge gone for {}: vwaps {}+{} qty {}",
                group.game_id, dir_vwap, opp_vwap, qty
            );
            return Ok(MergeOutcome::NotEligible);
        }

        let condition_id = signals
            .iter()
            .map(|s| s.condition_id.as_str())
            .find(|c| !c.is_empty())
            .context("no condition id on group signals")?
            .to_string();

        {
            let mut attempts = self.merge_attempts.lock().await;
            let count = attempts.entry(group.id).or_insert(0);
            if *count >= MERGE_MAX_ATTEMPTS {
                warn!(
                    "Merge for {} failed {} times, giving up",
                    group.game_id, count
                );
                attempts.remove(&group.id);
                return Ok(MergeOutcome::GaveUp);
            }
            *count += 1;
        }

        let tx_id = match gateway.merge_shares(&condition_id, qty).await {
            Ok(tx) => tx,
            Err(ClobError::RateLimited) | Err(ClobError::NetworkError(_)) => {
                return Ok(MergeOutcome::AttemptFailed);
            }
            Err(e) => {
                warn!("Merge submission failed for {}: {}", group.game_id, e);
                return Ok(MergeOutcome::AttemptFailed);
            }
        };

        self.merge_attempts.lock().await.remove(&group.id);

        // One matched pair redeems for exactly $1
        let combined = dir_vwap + opp_vwap;
        let gross_recovery = qty;
        let costs = Decimal::from_f64(
            self.sizing.expected_merge_fee_usd + self.sizing.expected_merge_gas_usd,
        )
        .unwrap_or(Decimal::ZERO);
        let net_recovery = gross_recovery - costs;

        let q_dir = group.q_dir - qty;
        let q_opp = group.q_opp - qty;
        let merged_qty = group.merged_qty + qty;
        self.db
            .update_group_quantities(group.id, q_dir, q_opp, merged_qty)
            .await?;
        self.db
            .insert_group_audit(
                group.id,
                "merge",
                group.state.as_str(),
                group.state.as_str(),
                q_dir - q_opp,
                q_dir.min(q_opp),
                group.d_max,
                Some(qty),
            )
            .await?;

        // Apportion the redemption to each leg pro-rata by cost basis
        for signal in &signals {
            let leg_vwap = match signal.signal_role {
                JobSide::Directional => dir_vwap,
                JobSide::Hedge => opp_vwap,
            };
            let leg_share = if combined > Decimal::ZERO {
                leg_vwap / combined
            } else {
                Decimal::new(5, 1)
            };
            let leg_filled = signal.filled_shares.unwrap_or(signal.shares);
            let role_total = role_filled_total(&signals, signal.signal_role);
            let weight = if role_total > Decimal::ZERO {
                leg_filled / role_total
            } else {
                Decimal::ZERO
            };
            let merged_for_signal = qty * weight;
            let recovery_for_signal = net_recovery * leg_share * weight;
            self.db
                .update_signal_merge(
                    signal.id,
                    signal.shares_merged + merged_for_signal,
                    signal.merge_recovery_usd + recovery_for_signal,
                )
                .await?;
        }

        info!(
            "Merged {} pairs for {} (edge {}/share, tx {})",
            qty, group.game_id, edge, tx_id
        );
        self.notifier
            .merge_executed(&group.game_id, qty, net_recovery)
            .await;

        Ok(MergeOutcome::Merged {
            qty,
            recovery_usd: net_recovery,
        })
    }

    /// Retire a group once both sides are flat: everything the group held
    /// was merged or redeemed, so it moves through settled to archived.
    /// Leftover exposure on either side blocks this.
    pub async fn archive_if_flat(&self, group: &PositionGroup) -> Result<bool> {
        if group.state == GroupState::Archived {
            return Ok(false);
        }
        if !group.q_dir.is_zero() || !group.q_opp.is_zero() {
            return Ok(false);
        }
        if group.state == GroupState::Open {
            if group.merged_qty.is_zero() {
                // Never traded; nothing to retire
                return Ok(false);
            }
            self.db.set_group_state(group.id, GroupState::Settled).await?;
            self.db
                .insert_group_audit(
                    group.id,
                    "settled",
                    GroupState::Open.as_str(),
                    GroupState::Settled.as_str(),
                    Decimal::ZERO,
                    Decimal::ZERO,
                    group.d_max,
                    None,
                )
                .await?;
        }
        self.db.set_group_state(group.id, GroupState::Archived).await?;
        self.db
            .insert_group_audit(
                group.id,
                "archived",
                GroupState::Settled.as_str(),
                GroupState::Archived.as_str(),
                Decimal::ZERO,
                Decimal::ZERO,
                group.d_max,
                None,
            )
            .await?;
        info!("PositionGroup {} archived", group.game_id);
        Ok(true)
    }

    pub async fn open_groups(&self) -> Result<Vec<PositionGroup>> {
        self.db.get_open_groups().await
    }
}

/// Fill VWAP per role across a game's signals
fn role_vwaps(signals: &[Signal]) -> (Option<Decimal>, Option<Decimal>) {
    let vwap = |role: JobSide| {
        let mut notional = Decimal::ZERO;
        let mut shares = Decimal::ZERO;
        for s in signals.iter().filter(|s| s.signal_role == role) {
            let filled = s.filled_shares.unwrap_or(s.shares);
            let price = s.fill_price.unwrap_or(s.target_price);
            notional += price * filled;
            shares += filled;
        }
        if shares.is_zero() {
            None
        } else {
            Some(notional / shares)
        }
    };
    (vwap(JobSide::Directional), vwap(JobSide::Hedge))
}

fn role_filled_total(signals: &[Signal], role: JobSide) -> Decimal {
    signals
        .iter()
        .filter(|s| s.signal_role == role)
        .map(|s| s.filled_shares.unwrap_or(s.shares))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewSignal, NewTradeJob};
    use crate::services::gateway::mock::MockGateway;
    use crate::types::{Confidence, OrderState, TeamSide};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn sizing() -> SizingConfig {
        SizingConfig {
            expected_merge_fee_usd: 0.0,
            expected_merge_gas_usd: 0.05,
            ..SizingConfig::default()
        }
    }

    async fn setup() -> (Arc<Database>, PositionGroupLedger) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let ledger = PositionGroupLedger::new(db.clone(), Notifier::disabled(), sizing());
        (db, ledger)
    }

    async fn make_filled_signal(
        db: &Database,
        game_id: &str,
        role: JobSide,
        price: Decimal,
        shares: Decimal,
        group: Option<&str>,
    ) -> Signal {
        let now = Utc::now();
        let job_id = db
            .create_job(&NewTradeJob {
                game_id: game_id.to_string(),
                away_team: "BOS".to_string(),
                home_team: "LAL".to_string(),
                game_date: "2026-04-07".to_string(),
                backed_side: TeamSide::Away,
                p_low: 0.6,
                confidence: Confidence::High,
                game_time: now + Duration::hours(4),
                execute_after: now - Duration::hours(1),
                execute_before: now + Duration::hours(3),
                job_side: role,
                paired_job_id: match role {
                    JobSide::Directional => None,
                    JobSide::Hedge => Some(
                        db.get_directional_job(game_id).await.unwrap().unwrap().id,
                    ),
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
                token_id: "tok".to_string(),
                condition_id: "0xcond".to_string(),
                target_price: price,
                kelly_size_usd: price * shares,
                shares,
                dca_seq: 0,
                bothside_group_id: group.map(|s| s.to_string()),
                signal_role: role,
            })
            .await
            .unwrap();
        db.mark_signal_placed(sig_id, "ord", price, now).await.unwrap();
        db.mark_signal_filled(sig_id, price, shares).await.unwrap();
        db.get_signal(sig_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_fill_within_bounds_has_no_violation() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(40), dec!(20), dec!(60))
            .await
            .unwrap();
        let sig = make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(50), None).await;
        ledger.record_fill(&sig, dec!(50)).await.unwrap();

        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        assert_eq!(group.q_dir, dec!(50));
        let audit = db.get_group_audit(group.id).await.unwrap();
        assert!(audit.iter().all(|a| a.reason != "imbalance_violation"));
    }

    #[tokio::test]
    async fn test_violation_recorded_not_corrected() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(0), dec!(20), dec!(20))
            .await
            .unwrap();
        let sig = make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(35), None).await;
        ledger.record_fill(&sig, dec!(35)).await.unwrap();

        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        // Quantities are the truth, not the clamp
        assert_eq!(group.q_dir, dec!(35));
        assert!(group.violates_imbalance());

        let audit = db.get_group_audit(group.id).await.unwrap();
        let violation = audit
            .iter()
            .find(|a| a.reason == "imbalance_violation")
            .expect("violation audit event");
        assert_eq!(violation.d, dec!(35));
        assert_eq!(violation.d_max, dec!(20));
    }

    #[tokio::test]
    async fn test_merge_reduces_both_sides() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(40), dec!(0), dec!(40))
            .await
            .unwrap();
        let dir =
            make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(40), Some("bg1"))
                .await;
        let opp =
            make_filled_signal(&db, "g1", JobSide::Hedge, dec!(0.35), dec!(40), Some("bg1")).await;
        ledger.record_fill(&dir, dec!(40)).await.unwrap();
        ledger.record_fill(&opp, dec!(40)).await.unwrap();

        let gateway = MockGateway::new();
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        let outcome = ledger.try_merge(&group, &gateway).await.unwrap();

        match outcome {
            MergeOutcome::Merged { qty, recovery_usd } => {
                assert_eq!(qty, dec!(40));
                assert!(recovery_usd > dec!(39));
            }
            other => panic!("expected merge, got {:?}", other),
        }

        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        assert_eq!(group.q_dir, Decimal::ZERO);
        assert_eq!(group.q_opp, Decimal::ZERO);
        assert_eq!(group.merged_qty, dec!(40));

        // Merge accounting landed on the signals
        let dir = db.get_signal(dir.id).await.unwrap();
        assert_eq!(dir.shares_merged, dec!(40));
        assert!(dir.merge_recovery_usd > Decimal::ZERO);
        // And only filled order-state fields stayed untouched
        assert_eq!(dir.order_status, OrderState::Filled);

        assert_eq!(gateway.merges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_not_eligible_without_opposite_inventory() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(0), dec!(20), dec!(25))
            .await
            .unwrap();
        let dir = make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(20), None).await;
        ledger.record_fill(&dir, dec!(20)).await.unwrap();

        let gateway = MockGateway::new();
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        let outcome = ledger.try_merge(&group, &gateway).await.unwrap();
        assert_eq!(outcome, MergeOutcome::NotEligible);
        assert!(gateway.merges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_not_eligible_when_edge_negative() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(40), dec!(0), dec!(40))
            .await
            .unwrap();
        // Combined fill cost 1.02, so merging would lock in a loss
        let dir =
            make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(40), Some("bg1"))
                .await;
        let opp =
            make_filled_signal(&db, "g1", JobSide::Hedge, dec!(0.42), dec!(40), Some("bg1")).await;
        ledger.record_fill(&dir, dec!(40)).await.unwrap();
        ledger.record_fill(&opp, dec!(40)).await.unwrap();

        let gateway = MockGateway::new();
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        let outcome = ledger.try_merge(&group, &gateway).await.unwrap();
        assert_eq!(outcome, MergeOutcome::NotEligible);
    }

    #[tokio::test]
    async fn test_flat_group_is_archived() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(40), dec!(0), dec!(40))
            .await
            .unwrap();
        let dir =
            make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(40), Some("bg1"))
                .await;
        let opp =
            make_filled_signal(&db, "g1", JobSide::Hedge, dec!(0.35), dec!(40), Some("bg1")).await;
        ledger.record_fill(&dir, dec!(40)).await.unwrap();
        ledger.record_fill(&opp, dec!(40)).await.unwrap();

        let gateway = MockGateway::new();
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        ledger.try_merge(&group, &gateway).await.unwrap();

        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        assert!(ledger.archive_if_flat(&group).await.unwrap());
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        assert_eq!(group.state, GroupState::Archived);

        // A group that never traded is left alone
        ledger
            .ensure_group("g2", dec!(10), dec!(5), dec!(15))
            .await
            .unwrap();
        let untouched = db.get_group_by_game("g2").await.unwrap().unwrap();
        assert!(!ledger.archive_if_flat(&untouched).await.unwrap());
    }

    #[tokio::test]
    async fn test_residual_imbalance_stays_directional() {
        let (db, ledger) = setup().await;
        ledger
            .ensure_group("g1", dec!(30), dec!(10), dec!(40))
            .await
            .unwrap();
        let dir =
            make_filled_signal(&db, "g1", JobSide::Directional, dec!(0.60), dec!(40), Some("bg1"))
                .await;
        let opp =
            make_filled_signal(&db, "g1", JobSide::Hedge, dec!(0.30), dec!(30), Some("bg1")).await;
        ledger.record_fill(&dir, dec!(40)).await.unwrap();
        ledger.record_fill(&opp, dec!(30)).await.unwrap();

        let gateway = MockGateway::new();
        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        let outcome = ledger.try_merge(&group, &gateway).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { qty, .. } if qty == dec!(30)));

        let group = db.get_group_by_game("g1").await.unwrap().unwrap();
        assert_eq!(group.q_dir, dec!(10));
        assert_eq!(group.q_opp, Decimal::ZERO);
    }
}
