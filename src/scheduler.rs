//! Job scheduler - drives TradeJobs through their state machine
//!
//! One pass per tick: expire jobs whose window closed, advance jobs whose
//! orders resolved, promote pending jobs whose window opened, execute jobs
//! that need an order on the book, then run the merge pass over open
//! position groups. The scheduler owns every job transition; fills and
//! inventory arrive only through the signal/group records the other
//! components persist.

use crate::config::Config;
use crate::db::{Database, NewSignal, NewTradeJob};
use crate::ledger::{MergeOutcome, PositionGroupLedger};
use crate::services::{ExchangeGateway, MarketDiscovery, Notifier};
use crate::sizing::{SizingEngine, SizingInputs, SizingTargets};
use crate::types::{
    JobSide, JobStatus, MergeStatus, MoneylineMarket, OrderEventKind, OrderState, Signal,
    TradeJob, TradingMode,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary counts for one scheduler pass
#[derive(Debug, Default, Clone)]
pub struct SchedulerSummary {
    pub expired: usize,
    pub advanced: usize,
    pub started: usize,
    pub placed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
    pub merged: usize,
    pub errors: usize,
}

/// Job scheduler
pub struct JobScheduler {
    db: Arc<Database>,
    gateway: Arc<dyn ExchangeGateway>,
    discovery: Arc<dyn MarketDiscovery>,
    ledger: Arc<PositionGroupLedger>,
    sizing: SizingEngine,
    notifier: Notifier,
    config: Config,
}

impl JobScheduler {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn ExchangeGateway>,
        discovery: Arc<dyn MarketDiscovery>,
        ledger: Arc<PositionGroupLedger>,
        notifier: Notifier,
        config: Config,
    ) -> Self {
        let sizing = SizingEngine::new(config.sizing.clone(), config.hedge.hedge_ratio);
        Self {
            db,
            gateway,
            discovery,
            ledger,
            sizing,
            notifier,
            config,
        }
    }

    /// One scheduler pass. Per-job errors are logged and counted; one bad
    /// job never aborts the pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<SchedulerSummary> {
        let mut summary = SchedulerSummary::default();

        self.expire_overdue(now, &mut summary).await;
        self.advance_resolved(now, &mut summary).await;
        self.start_pending(now, &mut summary).await;
        self.execute_ready(now, &mut summary).await;
        self.merge_pass(&mut summary).await;

        info!(
            "Scheduler pass: {} expired, {} advanced, {} started, {} placed, {} skipped, \
             {} deferred, {} failed, {} merged, {} errors",
            summary.expired,
            summary.advanced,
            summary.started,
            summary.placed,
            summary.skipped,
            summary.deferred,
            summary.failed,
            summary.merged,
            summary.errors
        );
        Ok(summary)
    }

    /// Window closed or tip-off passed: cancel whatever is resting and
    /// expire the job. Runs ahead of any retry budget.
    async fn expire_overdue(&self, now: DateTime<Utc>, summary: &mut SchedulerSummary) {
        let jobs = match self.db.get_active_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to load active jobs: {:#}", e);
                summary.errors += 1;
                return;
            }
        };

        for job in jobs.iter().filter(|j| j.window_closed(now)) {
            if let Err(e) = self.expire_job(job).await {
                warn!("Failed to expire job {}: {:#}", job.id, e);
                summary.errors += 1;
                continue;
            }
            summary.expired += 1;
        }
    }

    async fn expire_job(&self, job: &TradeJob) -> Result<()> {
        if let Some(signal) = self.db.latest_signal_for_job(job.id).await? {
            if signal.order_status == OrderState::Placed {
                if let Some(order_id) = signal.order_id.as_deref() {
                    if self.config.mode.is_live() {
                        if let Err(e) = self.gateway.cancel_order(order_id).await {
                            warn!(
                                "Cancel failed while expiring job {}: {}",
                                job.id, e
                            );
                        }
                    }
                }
                self.db
                    .mark_signal_terminal(signal.id, OrderState::Expired)
                    .await?;
                self.db
                    .insert_order_event(signal.id, OrderEventKind::Expired, None, None)
                    .await?;
                self.notifier.order_expired(&signal, "execution window closed").await;
            }
        }
        self.db.update_job_status(job.id, JobStatus::Expired).await?;
        info!("Job {} ({} {}) expired", job.id, job.game_id, job.job_side);
        Ok(())
    }

    /// Move executing jobs forward once their latest order reached a
    /// terminal state, and cycle dca_active jobs back into executing.
    async fn advance_resolved(&self, now: DateTime<Utc>, summary: &mut SchedulerSummary) {
        let executing = match self.db.get_jobs_by_status(JobStatus::Executing).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to load executing jobs: {:#}", e);
                summary.errors += 1;
                return;
            }
        };

        for job in &executing {
            match self.advance_one(job, now).await {
                Ok(true) => summary.advanced += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to advance job {}: {:#}", job.id, e);
                    summary.errors += 1;
                }
            }
        }

        // dca_active re-enters executing while the window is open
        let dca_jobs = match self.db.get_jobs_by_status(JobStatus::DcaActive).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to load dca_active jobs: {:#}", e);
                summary.errors += 1;
                return;
            }
        };
        for job in dca_jobs.iter().filter(|j| j.in_window(now)) {
            if let Err(e) = self.db.update_job_status(job.id, JobStatus::Executing).await {
                warn!("Failed to resume DCA job {}: {:#}", job.id, e);
                summary.errors += 1;
                continue;
            }
            summary.advanced += 1;
        }
    }

    /// Returns true when the job transitioned.
    async fn advance_one(&self, job: &TradeJob, now: DateTime<Utc>) -> Result<bool> {
        let Some(signal) = self.db.latest_signal_for_job(job.id).await? else {
            return Ok(false);
        };

        match signal.order_status {
            OrderState::Placed => Ok(false),
            OrderState::Created => {
                // A created-but-never-placed signal is a placement that
                // died mid-flight; fail it and let the retry budget decide
                self.db
                    .mark_signal_terminal(signal.id, OrderState::Failed)
                    .await?;
                self.retry_or_fail(job, "order placement did not complete")
                    .await?;
                Ok(true)
            }
            OrderState::Filled => {
                let entries_done = job.dca_entries_done + 1;
                if job.is_dca() {
                    self.db.record_dca_entry(job.id, entries_done).await?;
                }

                if job.is_dca() && entries_done < job.dca_max_entries {
                    self.db.update_job_status(job.id, JobStatus::DcaActive).await?;
                    info!(
                        "Job {} slice {}/{} filled, dca_active",
                        job.id, entries_done, job.dca_max_entries
                    );
                } else {
                    self.db.update_job_status(job.id, JobStatus::Executed).await?;
                    info!("Job {} executed", job.id);
                }

                if job.job_side == JobSide::Directional {
                    self.spawn_hedge_job(job, &signal, now).await?;
                }
                Ok(true)
            }
            OrderState::Cancelled | OrderState::Expired | OrderState::Failed => {
                self.retry_or_fail(job, "order did not fill").await?;
                Ok(true)
            }
        }
    }

    /// Bump the retry counter; past the budget the job fails for good.
    async fn retry_or_fail(&self, job: &TradeJob, reason: &str) -> Result<()> {
        let retries = self.db.bump_job_retry(job.id).await?;
        if retries > self.config.orders.max_job_retries {
            self.db.set_job_error(job.id, Some(reason)).await?;
            self.db.update_job_status(job.id, JobStatus::Failed).await?;
            self.notifier.job_failed(&job.game_id, job.job_side, reason).await;
            warn!("Job {} failed after {} retries: {}", job.id, retries, reason);
        } else {
            self.db.set_job_error(job.id, Some(reason)).await?;
            debug!("Job {} retry {} ({})", job.id, retries, reason);
        }
        Ok(())
    }

    /// After the first directional fill, stand up the hedge job for the
    /// mergeable portion of the book.
    async fn spawn_hedge_job(
        &self,
        job: &TradeJob,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(group) = self.db.get_group_by_game(&job.game_id).await? else {
            return Ok(());
        };
        if group.m_target <= Decimal::ZERO {
            return Ok(());
        }
        if self
            .db
            .get_latest_job(&job.game_id, JobSide::Hedge)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let bothside_group_id = signal
            .bothside_group_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let hedge_id = self
            .db
            .create_job(&NewTradeJob {
                game_id: job.game_id.clone(),
                away_team: job.away_team.clone(),
                home_team: job.home_team.clone(),
                game_date: job.game_date.clone(),
                backed_side: job.backed_side.opposite(),
                p_low: 1.0 - job.p_low,
                confidence: job.confidence,
                game_time: job.game_time,
                execute_after: now,
                execute_before: job.execute_before,
                job_side: JobSide::Hedge,
                paired_job_id: Some(job.id),
                bothside_group_id: Some(bothside_group_id),
                dca_group_id: None,
                dca_max_entries: 1,
                dca_slice_usd: None,
            })
            .await?;
        info!(
            "Hedge job {} created for {} (M* = {})",
            hedge_id, job.game_id, group.m_target
        );
        Ok(())
    }

    /// pending -> executing once inside the window. Hedge jobs also wait
    /// for their paired directional job to have at least one fill.
    async fn start_pending(&self, now: DateTime<Utc>, summary: &mut SchedulerSummary) {
        let pending = match self.db.get_jobs_by_status(JobStatus::Pending).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to load pending jobs: {:#}", e);
                summary.errors += 1;
                return;
            }
        };

        for job in pending.iter().filter(|j| j.in_window(now)) {
            if job.job_side == JobSide::Hedge {
                let Some(paired_id) = job.paired_job_id else {
                    warn!("Hedge job {} has no paired job", job.id);
                    summary.errors += 1;
                    continue;
                };
                match self.db.job_has_fill(paired_id).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!("Fill check failed for job {}: {:#}", job.id, e);
                        summary.errors += 1;
                        continue;
                    }
                }
            }
            if let Err(e) = self.db.update_job_status(job.id, JobStatus::Executing).await {
                warn!("Failed to start job {}: {:#}", job.id, e);
                summary.errors += 1;
                continue;
            }
            summary.started += 1;
        }
    }

    /// Execute every executing job that has no order in flight.
    async fn execute_ready(&self, now: DateTime<Utc>, summary: &mut SchedulerSummary) {
        let executing = match self.db.get_jobs_by_status(JobStatus::Executing).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed to load executing jobs: {:#}", e);
                summary.errors += 1;
                return;
            }
        };

        for job in &executing {
            let in_flight = match self.db.latest_signal_for_job(job.id).await {
                Ok(Some(sig)) => !sig.order_status.is_terminal(),
                Ok(None) => false,
                Err(e) => {
                    warn!("Failed to load signals for job {}: {:#}", job.id, e);
                    summary.errors += 1;
                    continue;
                }
            };
            if in_flight {
                continue;
            }

            match self.execute_job(job, now).await {
                Ok(ExecuteOutcome::Placed) => summary.placed += 1,
                Ok(ExecuteOutcome::Skipped) => summary.skipped += 1,
                Ok(ExecuteOutcome::Deferred) => summary.deferred += 1,
                Ok(ExecuteOutcome::Failed) => summary.failed += 1,
                Ok(ExecuteOutcome::Done) => summary.advanced += 1,
                Err(e) => {
                    warn!("Execution failed for job {}: {:#}", job.id, e);
                    summary.errors += 1;
                }
            }
        }
    }

    async fn execute_job(&self, job: &TradeJob, now: DateTime<Utc>) -> Result<ExecuteOutcome> {
        let market = self
            .discovery
            .fetch_moneyline_for_game(&job.away_team, &job.home_team, &job.game_date)
            .await?;

        let Some(market) = market else {
            // Live trading must not give up on a transient discovery gap;
            // paper/dry-run reports and moves on
            let msg = format!(
                "no moneyline market for {} @ {} on {}",
                job.away_team, job.home_team, job.game_date
            );
            self.db.set_job_error(job.id, Some(&msg)).await?;
            return match self.config.mode {
                TradingMode::Live => {
                    self.db.update_job_status(job.id, JobStatus::Pending).await?;
                    info!("Job {} deferred: {}", job.id, msg);
                    Ok(ExecuteOutcome::Deferred)
                }
                TradingMode::Paper | TradingMode::DryRun => {
                    self.db.update_job_status(job.id, JobStatus::Skipped).await?;
                    info!("Job {} skipped: {}", job.id, msg);
                    Ok(ExecuteOutcome::Skipped)
                }
            };
        };

        match job.job_side {
            JobSide::Directional => self.execute_directional(job, &market, now).await,
            JobSide::Hedge => self.execute_hedge(job, &market, now).await,
        }
    }

    async fn execute_directional(
        &self,
        job: &TradeJob,
        market: &MoneylineMarket,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let token_id = market.token_for(job.backed_side).to_string();
        let opp_token_id = market.token_for(job.backed_side.opposite()).to_string();

        // Live ask beats the discovery snapshot when available
        let dir_price = self
            .best_ask_or(&token_id, market.price_for(job.backed_side))
            .await;
        let opp_price = self
            .best_ask_or(&opp_token_id, market.price_for(job.backed_side.opposite()))
            .await;

        let targets = self.sizing.compute_targets(&SizingInputs {
            dir_price: dir_price.to_f64().unwrap_or(0.0),
            opp_price: opp_price.to_f64(),
            p_low: job.p_low,
            confidence: job.confidence,
            balance_usd: self.config.bankroll_usd,
            regime_multiplier: self.config.regime_multiplier,
        });

        if targets.is_zero() {
            self.db
                .set_job_error(job.id, Some("sizing produced zero targets"))
                .await?;
            self.db.update_job_status(job.id, JobStatus::Skipped).await?;
            info!("Job {} skipped: zero sizing targets", job.id);
            return Ok(ExecuteOutcome::Skipped);
        }

        let d_max = targets.mergeable_shares_dec() + targets.directional_shares_dec();
        self.ledger
            .ensure_group(
                &job.game_id,
                targets.mergeable_shares_dec(),
                targets.directional_shares_dec(),
                d_max,
            )
            .await?;

        // The bothside group id binds directional fills to the hedge leg
        let bothside_group_id = match (&job.bothside_group_id, targets.mergeable_shares > 0.0) {
            (Some(id), _) => Some(id.clone()),
            (None, true) => {
                let id = Uuid::new_v4().to_string();
                self.db.set_job_bothside_group(job.id, &id).await?;
                Some(id)
            }
            (None, false) => None,
        };

        let (slice_usd, dca_seq) =
            self.directional_slice(job, &targets, dir_price.to_f64().unwrap_or(0.0));
        if slice_usd < self.config.dca.min_slice_usd {
            self.db
                .set_job_error(job.id, Some("remaining slice below minimum"))
                .await?;
            self.db.update_job_status(job.id, JobStatus::Executed).await?;
            return Ok(ExecuteOutcome::Done);
        }

        let shares = (Decimal::from_f64(slice_usd).unwrap_or(Decimal::ZERO) / dir_price)
            .round_dp(2);
        if shares <= Decimal::ZERO {
            self.db.update_job_status(job.id, JobStatus::Skipped).await?;
            return Ok(ExecuteOutcome::Skipped);
        }

        self.place_signal(
            job,
            NewSignal {
                job_id: job.id,
                game_id: job.game_id.clone(),
                token_id,
                condition_id: market.condition_id.clone(),
                target_price: dir_price,
                kelly_size_usd: (dir_price * shares).round_dp(2),
                shares,
                dca_seq,
                bothside_group_id,
                signal_role: JobSide::Directional,
            },
            now,
        )
        .await
    }

    async fn execute_hedge(
        &self,
        job: &TradeJob,
        market: &MoneylineMarket,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let group = self
            .db
            .get_group_by_game(&job.game_id)
            .await?
            .context("hedge job without position group")?;

        let remaining = group.m_target - group.q_opp;
        if remaining <= Decimal::ZERO {
            self.db.update_job_status(job.id, JobStatus::Executed).await?;
            info!("Hedge job {} has nothing left to hedge", job.id);
            return Ok(ExecuteOutcome::Done);
        }

        // Hedge jobs back the opposite side, so backed_side is already the
        // hedge token's side
        let token_id = market.token_for(job.backed_side).to_string();
        let price = self
            .best_ask_or(&token_id, market.price_for(job.backed_side))
            .await;

        let group_id = job
            .bothside_group_id
            .clone()
            .context("hedge job without bothside group id")?;

        // Entry-time guard on the same ceiling the lifecycle manager
        // enforces on replaces
        if let Some(dir_vwap) = self.db.directional_vwap(&group_id).await? {
            if dir_vwap + price > self.config.hedge.combined_price_ceiling {
                let msg = format!(
                    "combined price {} over ceiling {}",
                    dir_vwap + price,
                    self.config.hedge.combined_price_ceiling
                );
                self.db.set_job_error(job.id, Some(&msg)).await?;
                debug!("Hedge job {} deferred: {}", job.id, msg);
                return Ok(ExecuteOutcome::Deferred);
            }
        }

        self.place_signal(
            job,
            NewSignal {
                job_id: job.id,
                game_id: job.game_id.clone(),
                token_id,
                condition_id: market.condition_id.clone(),
                target_price: price,
                kelly_size_usd: (price * remaining).round_dp(2),
                shares: remaining.round_dp(2),
                dca_seq: 0,
                bothside_group_id: Some(group_id),
                signal_role: JobSide::Hedge,
            },
            now,
        )
        .await
    }

    /// Per-slice budget and sequence number for a directional job. The
    /// directional orders implement the full q_dir target (D* plus the
    /// mergeable portion M*).
    fn directional_slice(&self, job: &TradeJob, targets: &SizingTargets, dir_price: f64) -> (f64, u32) {
        let total_usd = targets.directional_usd + targets.mergeable_shares * dir_price;
        if !job.is_dca() {
            return (total_usd, 0);
        }
        let slice = job
            .dca_slice_usd
            .and_then(|d| d.to_f64())
            .unwrap_or(total_usd / job.dca_max_entries as f64);
        (slice, job.dca_entries_done)
    }

    /// Create the signal, then place (or simulate) the order. The signal
    /// row is persisted before the exchange call so a crash in between
    /// leaves a resumable 'created' record.
    async fn place_signal(
        &self,
        job: &TradeJob,
        new: NewSignal,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        match self.config.mode {
            TradingMode::DryRun => {
                info!(
                    "[DRY-RUN] Would place {} {} {} shares at {} (${})",
                    new.signal_role, new.token_id, new.shares, new.target_price, new.kelly_size_usd
                );
                self.db.update_job_status(job.id, JobStatus::Executed).await?;
                return Ok(ExecuteOutcome::Done);
            }
            TradingMode::Paper => {
                let signal_id = self.db.create_signal(&new).await?;
                let order_id = format!("paper-{}", Uuid::new_v4());
                self.db
                    .mark_signal_placed(signal_id, &order_id, new.target_price, now)
                    .await?;
                self.db
                    .insert_order_event(
                        signal_id,
                        OrderEventKind::Placed,
                        Some(new.target_price),
                        None,
                    )
                    .await?;
                // Paper fills immediately at the intended price and flows
                // through the same ledger as a live fill
                self.db
                    .mark_signal_filled(signal_id, new.target_price, new.shares)
                    .await?;
                self.db
                    .insert_order_event(
                        signal_id,
                        OrderEventKind::Filled,
                        Some(new.target_price),
                        None,
                    )
                    .await?;
                let signal = self.db.get_signal(signal_id).await?;
                self.ledger.record_fill(&signal, new.shares).await?;
                self.notifier
                    .order_filled(&signal, new.target_price, new.shares)
                    .await;
                info!(
                    "[PAPER] Filled {} {} shares at {} for job {}",
                    new.signal_role, new.shares, new.target_price, job.id
                );
                return Ok(ExecuteOutcome::Placed);
            }
            TradingMode::Live => {}
        }

        let signal_id = self.db.create_signal(&new).await?;
        match self
            .gateway
            .place_limit_order(&new.token_id, new.target_price, new.shares)
            .await
        {
            Ok(order_id) => {
                self.db
                    .mark_signal_placed(signal_id, &order_id, new.target_price, now)
                    .await?;
                self.db
                    .insert_order_event(
                        signal_id,
                        OrderEventKind::Placed,
                        Some(new.target_price),
                        None,
                    )
                    .await?;
                self.db.set_job_error(job.id, None).await?;
                info!(
                    "Placed {} order {} for job {}: {} shares at {}",
                    new.signal_role, order_id, job.id, new.shares, new.target_price
                );
                Ok(ExecuteOutcome::Placed)
            }
            Err(e) => {
                self.db
                    .mark_signal_terminal(signal_id, OrderState::Failed)
                    .await?;
                let msg = format!("order placement rejected: {}", e);
                self.retry_or_fail(job, &msg).await?;
                let job = self.db.get_job(job.id).await?;
                if job.status == JobStatus::Failed {
                    Ok(ExecuteOutcome::Failed)
                } else {
                    Ok(ExecuteOutcome::Deferred)
                }
            }
        }
    }

    async fn best_ask_or(&self, token_id: &str, fallback: Decimal) -> Decimal {
        match self.gateway.get_best_ask(token_id).await {
            Ok(Some(ask)) => ask,
            Ok(None) => fallback,
            Err(e) => {
                debug!("Best ask lookup failed for {}: {}", token_id, e);
                fallback
            }
        }
    }

    /// Merge pass: try to settle matched pairs on every open group and
    /// reflect the outcome on the directional job's merge status.
    async fn merge_pass(&self, summary: &mut SchedulerSummary) {
        let groups = match self.ledger.open_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Failed to load open groups: {:#}", e);
                summary.errors += 1;
                return;
            }
        };

        for group in &groups {
            if group.q_opp <= Decimal::ZERO {
                continue;
            }
            let dir_job = match self.db.get_latest_job(&group.game_id, JobSide::Directional).await
            {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load directional job for {}: {:#}", group.game_id, e);
                    summary.errors += 1;
                    continue;
                }
            };

            match self.ledger.try_merge(group, self.gateway.as_ref()).await {
                Ok(MergeOutcome::Merged { qty, .. }) => {
                    summary.merged += 1;
                    if let Err(e) = self.db.set_job_merge_status(dir_job.id, MergeStatus::Merged).await
                    {
                        warn!("Failed to record merge status: {:#}", e);
                        summary.errors += 1;
                    }
                    info!("Merged {} pairs for {}", qty, group.game_id);
                }
                Ok(MergeOutcome::NotEligible) => {}
                Ok(MergeOutcome::AttemptFailed) => {
                    if let Err(e) = self
                        .db
                        .set_job_merge_status(dir_job.id, MergeStatus::Eligible)
                        .await
                    {
                        warn!("Failed to record merge status: {:#}", e);
                        summary.errors += 1;
                    }
                }
                Ok(MergeOutcome::GaveUp) => {
                    if let Err(e) = self
                        .db
                        .set_job_merge_status(dir_job.id, MergeStatus::MergeFailed)
                        .await
                    {
                        warn!("Failed to record merge status: {:#}", e);
                        summary.errors += 1;
                    }
                }
                Err(e) => {
                    warn!("Merge failed for {}: {:#}", group.game_id, e);
                    summary.errors += 1;
                }
            }
        }

        // Settled-and-flat groups leave the working set
        for group in &groups {
            if let Err(e) = self.ledger.archive_if_flat(group).await {
                warn!("Archive check failed for {}: {:#}", group.game_id, e);
                summary.errors += 1;
            }
        }
    }
}

/// What executing one job produced this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecuteOutcome {
    Placed,
    Skipped,
    Deferred,
    Failed,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClobApiConfig, DcaConfig, HedgeConfig, OrderLifecycleConfig, SizingConfig};
    use crate::services::discovery::mock::MockDiscovery;
    use crate::services::gateway::mock::MockGateway;
    use crate::types::{Confidence, TeamSide};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Arc<Database>,
        gateway: Arc<MockGateway>,
        discovery: Arc<MockDiscovery>,
        now: DateTime<Utc>,
    }

    fn test_config(mode: TradingMode) -> Config {
        Config {
            mode,
            database_path: ":memory:".to_string(),
            bankroll_usd: 1000.0,
            regime_multiplier: 1.0,
            tick_interval_seconds: 30,
            discord_webhook_url: None,
            clob: ClobApiConfig {
                endpoint: "http://localhost".to_string(),
                wallet_address: None,
                api_key: None,
                api_secret: None,
                api_passphrase: None,
            },
            sizing: SizingConfig::default(),
            orders: OrderLifecycleConfig {
                max_job_retries: 2,
                ..OrderLifecycleConfig::default()
            },
            hedge: HedgeConfig::default(),
            dca: DcaConfig {
                default_max_entries: 3,
                min_slice_usd: 1.0,
            },
        }
    }

    async fn fixture(mode: TradingMode) -> (Fixture, JobScheduler) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let gateway = Arc::new(MockGateway::new());
        let discovery = Arc::new(MockDiscovery::new());
        let config = test_config(mode);
        let ledger = Arc::new(PositionGroupLedger::new(
            db.clone(),
            Notifier::disabled(),
            config.sizing.clone(),
        ));
        let scheduler = JobScheduler::new(
            db.clone(),
            gateway.clone(),
            discovery.clone(),
            ledger,
            Notifier::disabled(),
            config.clone(),
        );
        (
            Fixture {
                db,
                gateway,
                discovery,
                now: Utc::now(),
            },
            scheduler,
        )
    }

    fn market() -> MoneylineMarket {
        MoneylineMarket {
            market_id: "m1".to_string(),
            condition_id: "0xcond".to_string(),
            question: "Celtics @ Lakers".to_string(),
            slug: "nba-bos-lal-2026-04-07".to_string(),
            home_token_id: "tok-home".to_string(),
            away_token_id: "tok-away".to_string(),
            home_price: dec!(0.40),
            away_price: dec!(0.58),
            game_start_time: None,
        }
    }

    fn new_job(fx: &Fixture) -> NewTradeJob {
        NewTradeJob {
            game_id: "2026-04-07-BOS-LAL".to_string(),
            away_team: "BOS".to_string(),
            home_team: "LAL".to_string(),
            game_date: "2026-04-07".to_string(),
            backed_side: TeamSide::Away,
            p_low: 0.66,
            confidence: Confidence::High,
            game_time: fx.now + Duration::hours(4),
            execute_after: fx.now - Duration::minutes(30),
            execute_before: fx.now + Duration::hours(3),
            job_side: JobSide::Directional,
            paired_job_id: None,
            bothside_group_id: None,
            dca_group_id: None,
            dca_max_entries: 1,
            dca_slice_usd: None,
        }
    }

    #[tokio::test]
    async fn test_no_market_live_defers_to_pending() {
        let (fx, scheduler) = fixture(TradingMode::Live).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();

        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error_message.is_some());
    }

    #[tokio::test]
    async fn test_no_market_paper_skips() {
        let (fx, scheduler) = fixture(TradingMode::Paper).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();

        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Skipped);
        assert!(job.error_message.is_some());
    }

    #[tokio::test]
    async fn test_live_places_order_and_group() {
        let (fx, scheduler) = fixture(TradingMode::Live).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executing);
        let signal = fx.db.latest_signal_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(signal.order_status, OrderState::Placed);
        assert_eq!(signal.signal_role, JobSide::Directional);
        assert!(signal.order_id.is_some());
        assert_eq!(fx.gateway.order_count(), 1);

        // Group created with targets and d_max
        let group = fx.db.get_group_by_game(&job.game_id).await.unwrap().unwrap();
        assert!(group.d_max > Decimal::ZERO);
        assert!(group.m_target > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_paper_fill_advances_and_spawns_hedge() {
        let (fx, scheduler) = fixture(TradingMode::Paper).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        // First pass: start + execute (paper fill)
        scheduler.run_pass(fx.now).await.unwrap();
        // Second pass: observe the fill, advance, spawn hedge
        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executed);

        let hedge = fx
            .db
            .get_latest_job(&job.game_id, JobSide::Hedge)
            .await
            .unwrap()
            .expect("hedge job spawned");
        assert_eq!(hedge.paired_job_id, Some(job_id));
        assert_eq!(hedge.backed_side, TeamSide::Home);
        assert!(hedge.bothside_group_id.is_some());

        // Group tracked the paper fill
        let group = fx.db.get_group_by_game(&job.game_id).await.unwrap().unwrap();
        assert!(group.q_dir > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_hedge_waits_for_directional_fill() {
        let (fx, scheduler) = fixture(TradingMode::Live).await;
        let dir_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        let mut hedge = new_job(&fx);
        hedge.job_side = JobSide::Hedge;
        hedge.backed_side = TeamSide::Home;
        hedge.paired_job_id = Some(dir_id);
        hedge.bothside_group_id = Some("bg1".to_string());
        let hedge_id = fx.db.create_job(&hedge).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        scheduler.run_pass(fx.now).await.unwrap();

        // Directional is executing, hedge still pending (no fill yet)
        assert_eq!(fx.db.get_job(dir_id).await.unwrap().status, JobStatus::Executing);
        assert_eq!(fx.db.get_job(hedge_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_window_close_expires_and_cancels() {
        let (fx, scheduler) = fixture(TradingMode::Live).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        scheduler.run_pass(fx.now).await.unwrap();
        let signal = fx.db.latest_signal_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(signal.order_status, OrderState::Placed);

        // Window closes
        let late = fx.now + Duration::hours(5);
        scheduler.run_pass(late).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Expired);
        let signal = fx.db.get_signal(signal.id).await.unwrap();
        assert_eq!(signal.order_status, OrderState::Expired);
        let order_id = signal.order_id.unwrap();
        assert!(fx.gateway.orders.lock().unwrap().get(&order_id).unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_placement_rejection_exhausts_retries_to_failed() {
        let (fx, scheduler) = fixture(TradingMode::Live).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());
        *fx.gateway.fail_placement.lock().unwrap() =
            Some(crate::services::ClobError::InsufficientBalance);

        // max_job_retries = 2, so the third rejected placement fails the job
        for _ in 0..3 {
            scheduler.run_pass(fx.now).await.unwrap();
        }

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_dca_job_cycles_through_slices() {
        let (fx, scheduler) = fixture(TradingMode::Paper).await;
        let mut job = new_job(&fx);
        job.dca_max_entries = 3;
        job.dca_group_id = Some("dca-1".to_string());
        job.dca_slice_usd = Some(dec!(10));
        let job_id = fx.db.create_job(&job).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        // Slice 1 fills in pass 1; pass 2 observes it -> dca_active -> executing
        scheduler.run_pass(fx.now).await.unwrap();
        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.dca_entries_done, 1);
        assert!(matches!(job.status, JobStatus::Executing | JobStatus::DcaActive));

        // Keep ticking until all slices are done
        for _ in 0..6 {
            scheduler.run_pass(fx.now).await.unwrap();
        }
        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executed);
        assert_eq!(job.dca_entries_done, 3);

        let signals = fx.db.get_signals_for_job(job_id).await.unwrap();
        assert_eq!(signals.len(), 3);
        let seqs: Vec<u32> = signals.iter().map(|s| s.dca_seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_full_paper_cycle_reaches_merge() {
        let (fx, scheduler) = fixture(TradingMode::Paper).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        // Directional fill -> hedge spawn -> hedge fill -> merge
        for _ in 0..5 {
            scheduler.run_pass(fx.now).await.unwrap();
        }

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executed);
        assert_eq!(job.merge_status, MergeStatus::Merged);

        let group = fx
            .db
            .get_group_by_game(&job.game_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.q_opp, Decimal::ZERO);
        assert!(group.merged_qty > Decimal::ZERO);
        // Residual directional exposure rides to settlement
        assert!(group.q_dir > Decimal::ZERO);
        assert_eq!(fx.gateway.merges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_no_signals() {
        let (fx, scheduler) = fixture(TradingMode::DryRun).await;
        let job_id = fx.db.create_job(&new_job(&fx)).await.unwrap();
        fx.discovery.insert("BOS", "LAL", "2026-04-07", market());

        scheduler.run_pass(fx.now).await.unwrap();

        let job = fx.db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executed);
        assert!(fx.db.get_signals_for_job(job_id).await.unwrap().is_empty());
        assert_eq!(fx.gateway.order_count(), 0);
    }
}
