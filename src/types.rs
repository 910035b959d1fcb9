//! Core types for the courtside trading bot

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution mode for the whole process.
///
/// Live places real orders. Paper simulates immediate fills at the target
/// price and runs them through the same ledger. DryRun logs intent only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paper,
    DryRun,
}

impl TradingMode {
    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::DryRun => write!(f, "dry-run"),
        }
    }
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(TradingMode::Live),
            "paper" => Ok(TradingMode::Paper),
            "dry-run" | "dryrun" | "dry_run" => Ok(TradingMode::DryRun),
            other => anyhow::bail!("unknown trading mode: {}", other),
        }
    }
}

/// Lifecycle state of a trade job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Executing,
    Executed,
    Skipped,
    Failed,
    Expired,
    DcaActive,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Executing => "executing",
            JobStatus::Executed => "executed",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::DcaActive => "dca_active",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// A job that can still transition toward execution.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Executing | JobStatus::DcaActive
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Executed
                | JobStatus::Skipped
                | JobStatus::Failed
                | JobStatus::Expired
                | JobStatus::Cancelled
        )
    }

    /// Legal state-machine edges. Cancellation is allowed from any
    /// non-terminal state; everything else follows the fixed graph.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        if from == to {
            return false;
        }
        match (from, to) {
            (_, Cancelled) => !from.is_terminal(),
            (Pending, Executing) => true,
            (Executing, Executed)
            | (Executing, Skipped)
            | (Executing, DcaActive)
            | (Executing, Pending)
            | (Executing, Failed)
            | (Executing, Expired) => true,
            (DcaActive, Executing)
            | (DcaActive, Executed)
            | (DcaActive, Expired)
            | (DcaActive, Failed) => true,
            (Pending, Expired) | (Pending, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "executing" => Ok(JobStatus::Executing),
            "executed" => Ok(JobStatus::Executed),
            "skipped" => Ok(JobStatus::Skipped),
            "failed" => Ok(JobStatus::Failed),
            "expired" => Ok(JobStatus::Expired),
            "dca_active" => Ok(JobStatus::DcaActive),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => anyhow::bail!("unknown job status: {}", other),
        }
    }
}

/// Which leg of a bothside pair a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSide {
    Directional,
    Hedge,
}

impl JobSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSide::Directional => "directional",
            JobSide::Hedge => "hedge",
        }
    }
}

impl fmt::Display for JobSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directional" => Ok(JobSide::Directional),
            "hedge" => Ok(JobSide::Hedge),
            other => anyhow::bail!("unknown job side: {}", other),
        }
    }
}

/// Merge progress for a bothside group, tracked on the directional job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStatus {
    NotEligible,
    Eligible,
    Merged,
    MergeFailed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::NotEligible => "not_eligible",
            MergeStatus::Eligible => "eligible",
            MergeStatus::Merged => "merged",
            MergeStatus::MergeFailed => "merge_failed",
        }
    }
}

impl FromStr for MergeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_eligible" => Ok(MergeStatus::NotEligible),
            "eligible" => Ok(MergeStatus::Eligible),
            "merged" => Ok(MergeStatus::Merged),
            "merge_failed" => Ok(MergeStatus::MergeFailed),
            other => anyhow::bail!("unknown merge status: {}", other),
        }
    }
}

/// Team side backed by a directional job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamSide {
    Home,
    Away,
}

impl TeamSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamSide::Home => "home",
            TeamSide::Away => "away",
        }
    }

    pub fn opposite(&self) -> TeamSide {
        match self {
            TeamSide::Home => TeamSide::Away,
            TeamSide::Away => TeamSide::Home,
        }
    }
}

impl fmt::Display for TeamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TeamSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(TeamSide::Home),
            "away" => Ok(TeamSide::Away),
            other => anyhow::bail!("unknown team side: {}", other),
        }
    }
}

/// Qualitative confidence on the calibrated win probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Sizing multiplier applied on top of the Kelly fraction.
    pub fn multiplier(&self) -> f64 {
        match self {
            Confidence::High => 1.0,
            Confidence::Medium => 0.7,
            Confidence::Low => 0.4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            other => anyhow::bail!("unknown confidence label: {}", other),
        }
    }
}

/// Lifecycle state of an order signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Created,
    Placed,
    Filled,
    Cancelled,
    Expired,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::Placed => "placed",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Expired => "expired",
            OrderState::Failed => "failed",
        }
    }

    /// No further lifecycle-field mutation is allowed past these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Expired | OrderState::Failed
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OrderState::Created),
            "placed" => Ok(OrderState::Placed),
            "filled" => Ok(OrderState::Filled),
            "cancelled" => Ok(OrderState::Cancelled),
            "expired" => Ok(OrderState::Expired),
            "failed" => Ok(OrderState::Failed),
            other => anyhow::bail!("unknown order state: {}", other),
        }
    }
}

/// Audit kind for order_events rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Placed,
    Filled,
    Cancelled,
    Replaced,
    Expired,
}

impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Placed => "placed",
            OrderEventKind::Filled => "filled",
            OrderEventKind::Cancelled => "cancelled",
            OrderEventKind::Replaced => "replaced",
            OrderEventKind::Expired => "expired",
        }
    }
}

/// One trade job per (game, side). Owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeJob {
    pub id: i64,
    /// `{date}-{AWAY}-{HOME}`, e.g. `2026-04-07-BOS-LAL`
    pub game_id: String,
    pub away_team: String,
    pub home_team: String,
    pub game_date: String,
    pub backed_side: TeamSide,
    /// Conservative calibrated win probability for the backed side
    pub p_low: f64,
    pub confidence: Confidence,
    /// Scheduled tip-off
    pub game_time: DateTime<Utc>,
    pub execute_after: DateTime<Utc>,
    pub execute_before: DateTime<Utc>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub dca_group_id: Option<String>,
    pub dca_entries_done: u32,
    pub dca_max_entries: u32,
    pub dca_slice_usd: Option<Decimal>,
    pub job_side: JobSide,
    pub paired_job_id: Option<i64>,
    pub bothside_group_id: Option<String>,
    pub merge_status: MergeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeJob {
    /// Whether `now` falls inside the execution window.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.execute_after && now < self.execute_before
    }

    /// Window closed or the game has tipped off.
    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.execute_before || now >= self.game_time
    }

    pub fn is_dca(&self) -> bool {
        self.dca_max_entries > 1
    }

    pub fn dca_entries_remaining(&self) -> u32 {
        self.dca_max_entries.saturating_sub(self.dca_entries_done)
    }
}

/// One execution attempt (an intended or placed order).
/// Order-lifecycle fields are owned by the lifecycle manager;
/// merge-accounting fields are owned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub job_id: i64,
    pub game_id: String,
    pub token_id: String,
    pub condition_id: String,
    pub target_price: Decimal,
    pub kelly_size_usd: Decimal,
    pub shares: Decimal,
    pub order_id: Option<String>,
    pub order_status: OrderState,
    pub fill_price: Option<Decimal>,
    pub filled_shares: Option<Decimal>,
    pub dca_seq: u32,
    pub bothside_group_id: Option<String>,
    pub signal_role: JobSide,
    pub shares_merged: Decimal,
    pub merge_recovery_usd: Decimal,
    pub realized_pnl_usd: Option<Decimal>,
    pub order_placed_at: Option<DateTime<Utc>>,
    pub order_replace_count: u32,
    pub order_last_checked_at: Option<DateTime<Utc>>,
    /// Price of the currently resting order (updated on replace)
    pub order_original_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Signal {
    /// Seconds the current resting order has been on the book.
    pub fn order_age_secs(&self, now: DateTime<Utc>) -> i64 {
        self.order_placed_at
            .map(|placed| now.signed_duration_since(placed).num_seconds())
            .unwrap_or(0)
    }
}

/// Append-only audit record of an order transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: i64,
    pub signal_id: i64,
    pub event: String,
    pub price: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a position group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Open,
    Settled,
    Archived,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Open => "open",
            GroupState::Settled => "settled",
            GroupState::Archived => "archived",
        }
    }
}

impl FromStr for GroupState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(GroupState::Open),
            "settled" => Ok(GroupState::Settled),
            "archived" => Ok(GroupState::Archived),
            other => anyhow::bail!("unknown group state: {}", other),
        }
    }
}

/// Per-game aggregate inventory. Owned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionGroup {
    pub id: i64,
    pub game_id: String,
    pub state: GroupState,
    /// Target mergeable matched-pair shares
    pub m_target: Decimal,
    /// Target directional-only shares
    pub d_target: Decimal,
    /// Held shares on the backed side
    pub q_dir: Decimal,
    /// Held shares on the opposite side
    pub q_opp: Decimal,
    pub merged_qty: Decimal,
    /// Maximum allowed directional-over-opposite imbalance
    pub d_max: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PositionGroup {
    /// Net directional exposure.
    pub fn imbalance(&self) -> Decimal {
        self.q_dir - self.q_opp
    }

    pub fn violates_imbalance(&self) -> bool {
        self.imbalance() > self.d_max
    }

    /// Matched-pair quantity available to merge.
    pub fn mergeable_qty(&self) -> Decimal {
        self.q_dir.min(self.q_opp)
    }
}

/// Append-only audit record of a position-group change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionGroupAuditEvent {
    pub id: i64,
    pub group_id: i64,
    pub reason: String,
    pub state_before: String,
    pub state_after: String,
    pub d: Decimal,
    pub m: Decimal,
    pub d_max: Decimal,
    pub merge_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// A tradable moneyline market returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneylineMarket {
    pub market_id: String,
    pub condition_id: String,
    pub question: String,
    pub slug: String,
    pub home_token_id: String,
    pub away_token_id: String,
    pub home_price: Decimal,
    pub away_price: Decimal,
    pub game_start_time: Option<DateTime<Utc>>,
}

impl MoneylineMarket {
    pub fn token_for(&self, side: TeamSide) -> &str {
        match side {
            TeamSide::Home => &self.home_token_id,
            TeamSide::Away => &self.away_token_id,
        }
    }

    pub fn price_for(&self, side: TeamSide) -> Decimal {
        match side {
            TeamSide::Home => self.home_price,
            TeamSide::Away => self.away_price,
        }
    }
}
