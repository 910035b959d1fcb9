//! SQLite persistence for trade jobs, signals, order events and position groups

use crate::types::{
    Confidence, GroupState, JobSide, JobStatus, MergeStatus, OrderEvent, OrderEventKind,
    OrderState, PositionGroup, PositionGroupAuditEvent, Signal, TeamSide, TradeJob,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Parameters for inserting a new trade job
#[derive(Debug, Clone)]
pub struct NewTradeJob {
    pub game_id: String,
    pub away_team: String,
    pub home_team: String,
    pub game_date: String,
    pub backed_side: TeamSide,
    pub p_low: f64,
    pub confidence: Confidence,
    pub game_time: DateTime<Utc>,
    pub execute_after: DateTime<Utc>,
    pub execute_before: DateTime<Utc>,
    pub job_side: JobSide,
    pub paired_job_id: Option<i64>,
    pub bothside_group_id: Option<String>,
    pub dca_group_id: Option<String>,
    pub dca_max_entries: u32,
    pub dca_slice_usd: Option<Decimal>,
}

/// Parameters for inserting a new signal
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub job_id: i64,
    pub game_id: String,
    pub token_id: String,
    pub condition_id: String,
    pub target_price: Decimal,
    pub kelly_size_usd: Decimal,
    pub shares: Decimal,
    pub dca_seq: u32,
    pub bothside_group_id: Option<String>,
    pub signal_role: JobSide,
}

/// One settled leg of a bothside group, as consumed by the hedge optimizer
#[derive(Debug, Clone)]
pub struct SettledLeg {
    pub bothside_group_id: String,
    pub signal_role: JobSide,
    pub cost_usd: f64,
    pub pnl_usd: f64,
    pub settled_at: DateTime<Utc>,
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps every
    /// statement on the same memory instance.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id TEXT NOT NULL,
                away_team TEXT NOT NULL,
                home_team TEXT NOT NULL,
                game_date TEXT NOT NULL,
                backed_side TEXT NOT NULL,
                p_low REAL NOT NULL,
                confidence TEXT NOT NULL,
                game_time TEXT NOT NULL,
                execute_after TEXT NOT NULL,
                execute_before TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                dca_group_id TEXT,
                dca_entries_done INTEGER NOT NULL DEFAULT 0,
                dca_max_entries INTEGER NOT NULL DEFAULT 1,
                dca_slice_usd TEXT,
                job_side TEXT NOT NULL,
                paired_job_id INTEGER,
                bothside_group_id TEXT,
                merge_status TEXT NOT NULL DEFAULT 'not_eligible',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                game_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                target_price TEXT NOT NULL,
                kelly_size_usd TEXT NOT NULL,
                shares TEXT NOT NULL,
                order_id TEXT,
                order_status TEXT NOT NULL DEFAULT 'created',
                fill_price TEXT,
                filled_shares TEXT,
                dca_seq INTEGER NOT NULL DEFAULT 0,
                bothside_group_id TEXT,
                signal_role TEXT NOT NULL,
                shares_merged TEXT NOT NULL DEFAULT '0',
                merge_recovery_usd TEXT NOT NULL DEFAULT '0',
                realized_pnl_usd TEXT,
                order_placed_at TEXT,
                order_replace_count INTEGER NOT NULL DEFAULT 0,
                order_last_checked_at TEXT,
                order_original_price TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES trade_jobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                price TEXT,
                best_ask TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (signal_id) REFERENCES signals(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL DEFAULT 'open',
                m_target TEXT NOT NULL DEFAULT '0',
                d_target TEXT NOT NULL DEFAULT '0',
                q_dir TEXT NOT NULL DEFAULT '0',
                q_opp TEXT NOT NULL DEFAULT '0',
                merged_qty TEXT NOT NULL DEFAULT '0',
                d_max TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_group_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                state_before TEXT NOT NULL,
                state_after TEXT NOT NULL,
                d TEXT NOT NULL,
                m TEXT NOT NULL,
                d_max TEXT NOT NULL,
                merge_amount TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (group_id) REFERENCES position_groups(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes for the per-tick queries
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON trade_jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_game ON trade_jobs(game_id, job_side)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(order_status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_job ON signals(job_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_signals_group ON signals(bothside_group_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_signal ON order_events(signal_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_group ON position_group_audit(group_id)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== TRADE JOBS ====================

    /// Insert a new trade job. Rejects a second active job for the same
    /// (game, side).
    pub async fn create_job(&self, new: &NewTradeJob) -> Result<i64> {
        let active: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM trade_jobs
            WHERE game_id = ? AND job_side = ?
              AND status IN ('pending', 'executing', 'dca_active')
            "#,
        )
        .bind(&new.game_id)
        .bind(new.job_side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = active {
            anyhow::bail!(
                "active {} job {} already exists for game {}",
                new.job_side,
                id,
                new.game_id
            );
        }

        if new.job_side == JobSide::Hedge {
            let paired = new
                .paired_job_id
                .context("hedge job requires paired_job_id")?;
            let pair = self.get_job(paired).await?;
            if pair.game_id != new.game_id || pair.job_side != JobSide::Directional {
                anyhow::bail!(
                    "paired job {} is not a directional job for game {}",
                    paired,
                    new.game_id
                );
            }
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO trade_jobs (
                game_id, away_team, home_team, game_date, backed_side, p_low, confidence,
                game_time, execute_after, execute_before, status, job_side, paired_job_id,
                bothside_group_id, dca_group_id, dca_max_entries, dca_slice_usd,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.game_id)
        .bind(&new.away_team)
        .bind(&new.home_team)
        .bind(&new.game_date)
        .bind(new.backed_side.as_str())
        .bind(new.p_low)
        .bind(new.confidence.as_str())
        .bind(new.game_time.to_rfc3339())
        .bind(new.execute_after.to_rfc3339())
        .bind(new.execute_before.to_rfc3339())
        .bind(new.job_side.as_str())
        .bind(new.paired_job_id)
        .bind(&new.bothside_group_id)
        .bind(&new.dca_group_id)
        .bind(new.dca_max_entries as i64)
        .bind(new.dca_slice_usd.map(|d| d.to_string()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_job(&self, id: i64) -> Result<TradeJob> {
        let row = sqlx::query("SELECT * FROM trade_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("trade job {} not found", id))?;
        row_to_job(&row)
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<TradeJob>> {
        let rows = sqlx::query("SELECT * FROM trade_jobs WHERE status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Jobs that can still move through the state machine
    pub async fn get_active_jobs(&self) -> Result<Vec<TradeJob>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_jobs WHERE status IN ('pending', 'executing', 'dca_active') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Most recent job for a (game, side), regardless of status
    pub async fn get_latest_job(&self, game_id: &str, side: JobSide) -> Result<Option<TradeJob>> {
        let row = sqlx::query(
            "SELECT * FROM trade_jobs WHERE game_id = ? AND job_side = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(game_id)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn get_directional_job(&self, game_id: &str) -> Result<Option<TradeJob>> {
        let row = sqlx::query(
            "SELECT * FROM trade_jobs WHERE game_id = ? AND job_side = 'directional' ORDER BY id DESC LIMIT 1",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Transition a job, enforcing the state-machine edges. An illegal edge
    /// is an error, never silently applied.
    pub async fn update_job_status(&self, id: i64, to: JobStatus) -> Result<()> {
        let job = self.get_job(id).await?;
        if !JobStatus::can_transition(job.status, to) {
            anyhow::bail!(
                "illegal job transition {} -> {} for job {}",
                job.status,
                to,
                id
            );
        }
        sqlx::query("UPDATE trade_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(to.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_error(&self, id: i64, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE trade_jobs SET error_message = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Increment the retry counter, returning the new count
    pub async fn bump_job_retry(&self, id: i64) -> Result<u32> {
        sqlx::query(
            "UPDATE trade_jobs SET retry_count = retry_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        let (count,): (i64,) = sqlx::query_as("SELECT retry_count FROM trade_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    pub async fn record_dca_entry(&self, id: i64, entries_done: u32) -> Result<()> {
        sqlx::query("UPDATE trade_jobs SET dca_entries_done = ?, updated_at = ? WHERE id = ?")
            .bind(entries_done as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_bothside_group(&self, id: i64, group_id: &str) -> Result<()> {
        sqlx::query("UPDATE trade_jobs SET bothside_group_id = ?, updated_at = ? WHERE id = ?")
            .bind(group_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_merge_status(&self, id: i64, status: MergeStatus) -> Result<()> {
        sqlx::query("UPDATE trade_jobs SET merge_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether any signal on this job has filled
    pub async fn job_has_fill(&self, job_id: i64) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM signals WHERE job_id = ? AND order_status = 'filled'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ==================== SIGNALS ====================

    pub async fn create_signal(&self, new: &NewSignal) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO signals (
                job_id, game_id, token_id, condition_id, target_price, kelly_size_usd,
                shares, order_status, dca_seq, bothside_group_id, signal_role,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'created', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.job_id)
        .bind(&new.game_id)
        .bind(&new.token_id)
        .bind(&new.condition_id)
        .bind(new.target_price.to_string())
        .bind(new.kelly_size_usd.to_string())
        .bind(new.shares.to_string())
        .bind(new.dca_seq as i64)
        .bind(&new.bothside_group_id)
        .bind(new.signal_role.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_signal(&self, id: i64) -> Result<Signal> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("signal {} not found", id))?;
        row_to_signal(&row)
    }

    /// Outstanding placed orders, oldest resting order first
    pub async fn get_placed_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM signals
            WHERE order_status = 'placed'
            ORDER BY order_placed_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_signal).collect()
    }

    pub async fn get_signals_for_job(&self, job_id: i64) -> Result<Vec<Signal>> {
        let rows = sqlx::query("SELECT * FROM signals WHERE job_id = ? ORDER BY id")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_signal).collect()
    }

    pub async fn latest_signal_for_job(&self, job_id: i64) -> Result<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE job_id = ? ORDER BY id DESC LIMIT 1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_signal).transpose()
    }

    pub async fn mark_signal_placed(
        &self,
        id: i64,
        order_id: &str,
        price: Decimal,
        placed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals
            SET order_id = ?, order_status = 'placed', order_placed_at = ?,
                order_original_price = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(order_id)
        .bind(placed_at.to_rfc3339())
        .bind(price.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a signal filled. Refuses to touch a signal already in a
    /// terminal order state.
    pub async fn mark_signal_filled(
        &self,
        id: i64,
        fill_price: Decimal,
        filled_shares: Decimal,
    ) -> Result<()> {
        let signal = self.get_signal(id).await?;
        if signal.order_status.is_terminal() {
            anyhow::bail!(
                "signal {} already terminal ({}), refusing fill",
                id,
                signal.order_status
            );
        }
        sqlx::query(
            r#"
            UPDATE signals
            SET order_status = 'filled', fill_price = ?, filled_shares = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(fill_price.to_string())
        .bind(filled_shares.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a signal cancelled/expired/failed
    pub async fn mark_signal_terminal(&self, id: i64, state: OrderState) -> Result<()> {
        if !state.is_terminal() {
            anyhow::bail!("{} is not a terminal order state", state);
        }
        let signal = self.get_signal(id).await?;
        if signal.order_status.is_terminal() {
            anyhow::bail!(
                "signal {} already terminal ({}), refusing {}",
                id,
                signal.order_status,
                state
            );
        }
        sqlx::query("UPDATE signals SET order_status = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_signal_checked(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE signals SET order_last_checked_at = ?, updated_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Swap in the replacement order after a cancel-and-replace
    pub async fn apply_signal_replacement(
        &self,
        id: i64,
        new_order_id: &str,
        new_price: Decimal,
        placed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals
            SET order_id = ?, order_original_price = ?, order_placed_at = ?,
                order_replace_count = order_replace_count + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_order_id)
        .bind(new_price.to_string())
        .bind(placed_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Volume-weighted average fill price of the directional leg of a
    /// bothside group
    pub async fn directional_vwap(&self, bothside_group_id: &str) -> Result<Option<Decimal>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT fill_price, filled_shares FROM signals
            WHERE bothside_group_id = ? AND signal_role = 'directional'
              AND order_status = 'filled'
            "#,
        )
        .bind(bothside_group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut notional = Decimal::ZERO;
        let mut shares = Decimal::ZERO;
        for (price, size) in &rows {
            let price = Decimal::from_str(price)?;
            let size = Decimal::from_str(size)?;
            notional += price * size;
            shares += size;
        }
        if shares.is_zero() {
            return Ok(None);
        }
        Ok(Some(notional / shares))
    }

    /// Record merge accounting on a signal (ledger-owned fields)
    pub async fn update_signal_merge(
        &self,
        id: i64,
        shares_merged: Decimal,
        recovery_usd: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE signals SET shares_merged = ?, merge_recovery_usd = ?, updated_at = ? WHERE id = ?",
        )
        .bind(shares_merged.to_string())
        .bind(recovery_usd.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All filled signals for a game, across jobs and roles
    pub async fn get_filled_signals_for_game(&self, game_id: &str) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE game_id = ? AND order_status = 'filled' ORDER BY id",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_signal).collect()
    }

    pub async fn set_signal_settlement(&self, id: i64, pnl_usd: Decimal) -> Result<()> {
        sqlx::query("UPDATE signals SET realized_pnl_usd = ?, updated_at = ? WHERE id = ?")
            .bind(pnl_usd.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Settled bothside legs for the hedge ratio optimizer
    pub async fn get_settled_bothside_legs(&self) -> Result<Vec<SettledLeg>> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT bothside_group_id, signal_role, fill_price, filled_shares,
                   realized_pnl_usd, updated_at
            FROM signals
            WHERE bothside_group_id IS NOT NULL
              AND order_status = 'filled'
              AND realized_pnl_usd IS NOT NULL
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut legs = Vec::with_capacity(rows.len());
        for (group_id, role, fill_price, filled_shares, pnl, updated_at) in rows {
            let price: f64 = fill_price.parse().unwrap_or(0.0);
            let shares: f64 = filled_shares.parse().unwrap_or(0.0);
            legs.push(SettledLeg {
                bothside_group_id: group_id,
                signal_role: role.parse()?,
                cost_usd: price * shares,
                pnl_usd: pnl.parse().unwrap_or(0.0),
                settled_at: parse_ts(&updated_at)?,
            });
        }
        Ok(legs)
    }

    // ==================== ORDER EVENTS ====================

    pub async fn insert_order_event(
        &self,
        signal_id: i64,
        kind: OrderEventKind,
        price: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO order_events (signal_id, event, price, best_ask, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(signal_id)
        .bind(kind.as_str())
        .bind(price.map(|p| p.to_string()))
        .bind(best_ask.map(|p| p.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_order_events(&self, signal_id: i64) -> Result<Vec<OrderEvent>> {
        let rows = sqlx::query("SELECT * FROM order_events WHERE signal_id = ? ORDER BY id")
            .bind(signal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order_event).collect()
    }

    // ==================== POSITION GROUPS ====================

    pub async fn get_group_by_game(&self, game_id: &str) -> Result<Option<PositionGroup>> {
        let row = sqlx::query("SELECT * FROM position_groups WHERE game_id = ?")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_group).transpose()
    }

    pub async fn get_group(&self, id: i64) -> Result<PositionGroup> {
        let row = sqlx::query("SELECT * FROM position_groups WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("position group {} not found", id))?;
        row_to_group(&row)
    }

    pub async fn create_group(
        &self,
        game_id: &str,
        m_target: Decimal,
        d_target: Decimal,
        d_max: Decimal,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO position_groups (game_id, state, m_target, d_target, d_max, created_at, updated_at)
            VALUES (?, 'open', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(game_id)
        .bind(m_target.to_string())
        .bind(d_target.to_string())
        .bind(d_max.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_group_quantities(
        &self,
        id: i64,
        q_dir: Decimal,
        q_opp: Decimal,
        merged_qty: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE position_groups SET q_dir = ?, q_opp = ?, merged_qty = ?, updated_at = ? WHERE id = ?",
        )
        .bind(q_dir.to_string())
        .bind(q_opp.to_string())
        .bind(merged_qty.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_group_state(&self, id: i64, state: GroupState) -> Result<()> {
        sqlx::query("UPDATE position_groups SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_open_groups(&self) -> Result<Vec<PositionGroup>> {
        let rows = sqlx::query("SELECT * FROM position_groups WHERE state = 'open' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_group).collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_group_audit(
        &self,
        group_id: i64,
        reason: &str,
        state_before: &str,
        state_after: &str,
        d: Decimal,
        m: Decimal,
        d_max: Decimal,
        merge_amount: Option<Decimal>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO position_group_audit
                (group_id, reason, state_before, state_after, d, m, d_max, merge_amount, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(reason)
        .bind(state_before)
        .bind(state_after)
        .bind(d.to_string())
        .bind(m.to_string())
        .bind(d_max.to_string())
        .bind(merge_amount.map(|v| v.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_group_audit(&self, group_id: i64) -> Result<Vec<PositionGroupAuditEvent>> {
        let rows =
            sqlx::query("SELECT * FROM position_group_audit WHERE group_id = ? ORDER BY id")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_audit).collect()
    }

    // ==================== STATS ====================

    pub async fn count_jobs_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM trade_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT realized_pnl_usd FROM signals WHERE realized_pnl_usd IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|(v,)| v.parse::<f64>().ok())
            .sum())
    }

    pub async fn total_merge_recovery(&self) -> Result<f64> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT merge_recovery_usd FROM signals WHERE merge_recovery_usd != '0'")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .filter_map(|(v,)| v.parse::<f64>().ok())
            .sum())
    }
}

// ==================== ROW MAPPING ====================

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("bad decimal: {}", s))
}

fn parse_opt_dec(s: Option<String>) -> Result<Option<Decimal>> {
    s.as_deref().map(parse_dec).transpose()
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<TradeJob> {
    Ok(TradeJob {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        away_team: row.try_get("away_team")?,
        home_team: row.try_get("home_team")?,
        game_date: row.try_get("game_date")?,
        backed_side: row.try_get::<String, _>("backed_side")?.parse()?,
        p_low: row.try_get("p_low")?,
        confidence: row.try_get::<String, _>("confidence")?.parse()?,
        game_time: parse_ts(&row.try_get::<String, _>("game_time")?)?,
        execute_after: parse_ts(&row.try_get::<String, _>("execute_after")?)?,
        execute_before: parse_ts(&row.try_get::<String, _>("execute_before")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        error_message: row.try_get("error_message")?,
        dca_group_id: row.try_get("dca_group_id")?,
        dca_entries_done: row.try_get::<i64, _>("dca_entries_done")? as u32,
        dca_max_entries: row.try_get::<i64, _>("dca_max_entries")? as u32,
        dca_slice_usd: parse_opt_dec(row.try_get("dca_slice_usd")?)?,
        job_side: row.try_get::<String, _>("job_side")?.parse()?,
        paired_job_id: row.try_get("paired_job_id")?,
        bothside_group_id: row.try_get("bothside_group_id")?,
        merge_status: row.try_get::<String, _>("merge_status")?.parse()?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> Result<Signal> {
    Ok(Signal {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        game_id: row.try_get("game_id")?,
        token_id: row.try_get("token_id")?,
        condition_id: row.try_get("condition_id")?,
        target_price: parse_dec(&row.try_get::<String, _>("target_price")?)?,
        kelly_size_usd: parse_dec(&row.try_get::<String, _>("kelly_size_usd")?)?,
        shares: parse_dec(&row.try_get::<String, _>("shares")?)?,
        order_id: row.try_get("order_id")?,
        order_status: row.try_get::<String, _>("order_status")?.parse()?,
        fill_price: parse_opt_dec(row.try_get("fill_price")?)?,
        filled_shares: parse_opt_dec(row.try_get("filled_shares")?)?,
        dca_seq: row.try_get::<i64, _>("dca_seq")? as u32,
        bothside_group_id: row.try_get("bothside_group_id")?,
        signal_role: row.try_get::<String, _>("signal_role")?.parse()?,
        shares_merged: parse_dec(&row.try_get::<String, _>("shares_merged")?)?,
        merge_recovery_usd: parse_dec(&row.try_get::<String, _>("merge_recovery_usd")?)?,
        realized_pnl_usd: parse_opt_dec(row.try_get("realized_pnl_usd")?)?,
        order_placed_at: parse_opt_ts(row.try_get("order_placed_at")?)?,
        order_replace_count: row.try_get::<i64, _>("order_replace_count")? as u32,
        order_last_checked_at: parse_opt_ts(row.try_get("order_last_checked_at")?)?,
        order_original_price: parse_opt_dec(row.try_get("order_original_price")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_order_event(row: &sqlx::sqlite::SqliteRow) -> Result<OrderEvent> {
    Ok(OrderEvent {
        id: row.try_get("id")?,
        signal_id: row.try_get("signal_id")?,
        event: row.try_get("event")?,
        price: parse_opt_dec(row.try_get("price")?)?,
        best_ask: parse_opt_dec(row.try_get("best_ask")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Result<PositionGroup> {
    Ok(PositionGroup {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        m_target: parse_dec(&row.try_get::<String, _>("m_target")?)?,
        d_target: parse_dec(&row.try_get::<String, _>("d_target")?)?,
        q_dir: parse_dec(&row.try_get::<String, _>("q_dir")?)?,
        q_opp: parse_dec(&row.try_get::<String, _>("q_opp")?)?,
        merged_qty: parse_dec(&row.try_get::<String, _>("merged_qty")?)?,
        d_max: parse_dec(&row.try_get::<String, _>("d_max")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_audit(row: &sqlx::sqlite::SqliteRow) -> Result<PositionGroupAuditEvent> {
    Ok(PositionGroupAuditEvent {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        reason: row.try_get("reason")?,
        state_before: row.try_get("state_before")?,
        state_after: row.try_get("state_after")?,
        d: parse_dec(&row.try_get::<String, _>("d")?)?,
        m: parse_dec(&row.try_get::<String, _>("m")?)?,
        d_max: parse_dec(&row.try_get::<String, _>("d_max")?)?,
        merge_amount: parse_opt_dec(row.try_get("merge_amount")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample_job(game_id: &str, side: JobSide) -> NewTradeJob {
        let now = Utc::now();
        NewTradeJob {
            game_id: game_id.to_string(),
            away_team: "BOS".to_string(),
            home_team: "LAL".to_string(),
            game_date: "2026-04-07".to_string(),
            backed_side: TeamSide::Away,
            p_low: 0.62,
            confidence: Confidence::High,
            game_time: now + Duration::hours(6),
            execute_after: now - Duration::hours(1),
            execute_before: now + Duration::hours(5),
            job_side: side,
            paired_job_id: None,
            bothside_group_id: None,
            dca_group_id: None,
            dca_max_entries: 1,
            dca_slice_usd: None,
        }
    }

    fn sample_signal(job_id: i64, game_id: &str) -> NewSignal {
        NewSignal {
            job_id,
            game_id: game_id.to_string(),
            token_id: "123456".to_string(),
            condition_id: "0xabc".to_string(),
            target_price: dec!(0.62),
            kelly_size_usd: dec!(25),
            shares: dec!(40),
            dca_seq: 0,
            bothside_group_id: None,
            signal_role: JobSide::Directional,
        }
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();
        let job = db.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.backed_side, TeamSide::Away);
        assert_eq!(job.merge_status, MergeStatus::NotEligible);
    }

    #[tokio::test]
    async fn test_duplicate_active_job_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();
        let err = db.create_job(&sample_job("g1", JobSide::Directional)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();
        db.update_job_status(id, JobStatus::Executing).await.unwrap();
        db.update_job_status(id, JobStatus::Executed).await.unwrap();
        // executed -> pending must be refused
        assert!(db.update_job_status(id, JobStatus::Pending).await.is_err());
        let job = db.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Executed);
    }

    #[tokio::test]
    async fn test_hedge_requires_directional_pair() {
        let db = Database::open_in_memory().await.unwrap();
        let mut hedge = sample_job("g1", JobSide::Hedge);
        hedge.paired_job_id = None;
        assert!(db.create_job(&hedge).await.is_err());

        let dir_id = db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();
        hedge.paired_job_id = Some(dir_id);
        assert!(db.create_job(&hedge).await.is_ok());
    }

    #[tokio::test]
    async fn test_filled_signal_is_immutable() {
        let db = Database::open_in_memory().await.unwrap();
        let job_id = db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();
        let sig_id = db.create_signal(&sample_signal(job_id, "g1")).await.unwrap();
        db.mark_signal_placed(sig_id, "ord-1", dec!(0.62), Utc::now())
            .await
            .unwrap();
        db.mark_signal_filled(sig_id, dec!(0.61), dec!(40)).await.unwrap();

        // A second terminal transition is refused
        assert!(db.mark_signal_terminal(sig_id, OrderState::Cancelled).await.is_err());
        assert!(db.mark_signal_filled(sig_id, dec!(0.50), dec!(40)).await.is_err());

        let signal = db.get_signal(sig_id).await.unwrap();
        assert_eq!(signal.order_status, OrderState::Filled);
        assert!(signal.fill_price.unwrap() > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_directional_vwap() {
        let db = Database::open_in_memory().await.unwrap();
        let job_id = db.create_job(&sample_job("g1", JobSide::Directional)).await.unwrap();

        let mut new = sample_signal(job_id, "g1");
        new.bothside_group_id = Some("grp-1".to_string());
        let a = db.create_signal(&new).await.unwrap();
        let b = db.create_signal(&new).await.unwrap();
        db.mark_signal_placed(a, "o1", dec!(0.60), Utc::now()).await.unwrap();
        db.mark_signal_placed(b, "o2", dec!(0.70), Utc::now()).await.unwrap();
        db.mark_signal_filled(a, dec!(0.60), dec!(10)).await.unwrap();
        db.mark_signal_filled(b, dec!(0.70), dec!(30)).await.unwrap();

        let vwap = db.directional_vwap("grp-1").await.unwrap().unwrap();
        assert_eq!(vwap, dec!(0.675));
        assert!(db.directional_vwap("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_round_trip_and_audit() {
        let db = Database::open_in_memory().await.unwrap();
        let gid = db.create_group("g1", dec!(40), dec!(20), dec!(25)).await.unwrap();
        db.update_group_quantities(gid, dec!(30), dec!(10), Decimal::ZERO)
            .await
            .unwrap();
        db.insert_group_audit(gid, "fill", "open", "open", dec!(20), dec!(10), dec!(25), None)
            .await
            .unwrap();

        let group = db.get_group(gid).await.unwrap();
        assert_eq!(group.q_dir, dec!(30));
        assert_eq!(group.imbalance(), dec!(20));

        let audit = db.get_group_audit(gid).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].reason, "fill");
    }
}
