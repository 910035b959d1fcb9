//! Hedge ratio optimizer - offline grid search over settled bothside groups
//!
//! Each settled group carries the realized cost and PnL of both legs. For a
//! candidate ratio the historical hedge PnL is rescaled linearly by
//! `ratio / observed_ratio`, and the objective trades total PnL against the
//! max drawdown of the settlement-ordered equity curve. The winning ratio
//! feeds back into `HedgeConfig::hedge_ratio`.

use crate::db::SettledLeg;
use crate::types::JobSide;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// One settled bothside group: realized costs and PnL for both legs
#[derive(Debug, Clone)]
pub struct HedgeRatioGroupSample {
    pub bothside_group_id: String,
    pub directional_cost_usd: f64,
    pub hedge_cost_usd: f64,
    pub directional_pnl_usd: f64,
    pub hedge_pnl_usd: f64,
    pub settled_at: DateTime<Utc>,
}

impl HedgeRatioGroupSample {
    /// Hedge-to-directional capital ratio actually traded
    pub fn observed_ratio(&self) -> f64 {
        self.hedge_cost_usd / self.directional_cost_usd
    }
}

/// Objective breakdown for one candidate ratio
#[derive(Debug, Clone)]
pub struct RatioEvaluation {
    pub ratio: f64,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub objective: f64,
}

/// Fold settled legs into per-group samples. Groups missing either leg,
/// with non-positive cost on either side, or with a non-positive observed
/// ratio are dropped - they can't be rescaled from a valid base.
pub fn build_group_samples(legs: &[SettledLeg]) -> Vec<HedgeRatioGroupSample> {
    #[derive(Default)]
    struct Acc {
        dir_cost: f64,
        dir_pnl: f64,
        hedge_cost: f64,
        hedge_pnl: f64,
        settled_at: Option<DateTime<Utc>>,
    }

    let mut groups: BTreeMap<String, Acc> = BTreeMap::new();
    for leg in legs {
        let acc = groups.entry(leg.bothside_group_id.clone()).or_default();
        match leg.signal_role {
            JobSide::Directional => {
                acc.dir_cost += leg.cost_usd;
                acc.dir_pnl += leg.pnl_usd;
            }
            JobSide::Hedge => {
                acc.hedge_cost += leg.cost_usd;
                acc.hedge_pnl += leg.pnl_usd;
            }
        }
        acc.settled_at = Some(match acc.settled_at {
            Some(t) if t >= leg.settled_at => t,
            _ => leg.settled_at,
        });
    }

    let mut samples: Vec<HedgeRatioGroupSample> = groups
        .into_iter()
        .filter_map(|(group_id, acc)| {
            if acc.dir_cost <= 0.0 || acc.hedge_cost <= 0.0 {
                debug!("Dropping group {}: missing or zero-cost leg", group_id);
                return None;
            }
            let sample = HedgeRatioGroupSample {
                bothside_group_id: group_id,
                directional_cost_usd: acc.dir_cost,
                hedge_cost_usd: acc.hedge_cost,
                directional_pnl_usd: acc.dir_pnl,
                hedge_pnl_usd: acc.hedge_pnl,
                settled_at: acc.settled_at.unwrap_or_else(Utc::now),
            };
            if sample.observed_ratio() <= 0.0 {
                return None;
            }
            Some(sample)
        })
        .collect();

    samples.sort_by_key(|s| s.settled_at);
    samples
}

/// Evaluate one candidate ratio: total PnL with the hedge leg rescaled by
/// `ratio / observed_ratio`, minus a drawdown penalty over the
/// settlement-ordered equity curve.
pub fn evaluate_hedge_ratio(
    samples: &[HedgeRatioGroupSample],
    ratio: f64,
    dd_penalty: f64,
) -> RatioEvaluation {
    let mut ordered: Vec<&HedgeRatioGroupSample> = samples.iter().collect();
    ordered.sort_by_key(|s| s.settled_at);

    let mut cumulative = 0.0;
    let mut peak = 0.0_f64;
    let mut max_drawdown = 0.0_f64;

    for sample in &ordered {
        let scale = ratio / sample.observed_ratio();
        let group_pnl = sample.directional_pnl_usd + sample.hedge_pnl_usd * scale;
        cumulative += group_pnl;
        peak = peak.max(cumulative);
        max_drawdown = max_drawdown.max(peak - cumulative);
    }

    RatioEvaluation {
        ratio,
        total_pnl: cumulative,
        max_drawdown,
        objective: cumulative - dd_penalty * max_drawdown,
    }
}

/// Grid-search the ratio over `[min_ratio, max_ratio]` at `step`. Returns
/// the best-scoring evaluation plus the full table.
pub fn optimize_hedge_ratio(
    samples: &[HedgeRatioGroupSample],
    min_ratio: f64,
    max_ratio: f64,
    step: f64,
    dd_penalty: f64,
) -> Result<(RatioEvaluation, Vec<RatioEvaluation>)> {
    if step <= 0.0 {
        anyhow::bail!("ratio step must be positive");
    }
    if min_ratio > max_ratio {
        anyhow::bail!("min_ratio {} exceeds max_ratio {}", min_ratio, max_ratio);
    }

    let mut table = Vec::new();
    let steps = ((max_ratio - min_ratio) / step).round() as usize;
    for i in 0..=steps {
        let ratio = (min_ratio + i as f64 * step).min(max_ratio);
        table.push(evaluate_hedge_ratio(samples, ratio, dd_penalty));
    }

    let best = table
        .iter()
        .max_by(|a, b| {
            a.objective
                .partial_cmp(&b.objective)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .expect("grid has at least one point");

    Ok((best, table))
}
