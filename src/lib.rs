//! Courtside Trading Bot Library
//!
//! Automates entry, hedging, and capital-efficient exit of paired
//! Polymarket positions around NBA games:
//!
//! 1. **Directional entries**: conservative-Kelly sized moneyline positions,
//!    optionally split into DCA slices across the pre-game window.
//! 2. **Hedged pairs**: a matched opposite-side leg sized to the mergeable
//!    portion of the book, exited early through the MERGE settlement
//!    primitive whenever combined price + costs leave an edge.

pub mod config;
pub mod db;
pub mod ledger;
pub mod lifecycle;
pub mod optimizer;
pub mod scheduler;
pub mod services;
pub mod sizing;
pub mod types;

pub use config::Config;
pub use db::Database;
pub use ledger::PositionGroupLedger;
pub use lifecycle::{OrderCheckOutcome, OrderLifecycleManager};
pub use optimizer::{build_group_samples, optimize_hedge_ratio, HedgeRatioGroupSample};
pub use scheduler::JobScheduler;
pub use services::{ClobGateway, ExchangeGateway, GammaDiscovery, MarketDiscovery, Notifier};
pub use sizing::{SizingEngine, SizingInputs, SizingTargets};
pub use types::{
    JobSide, JobStatus, MoneylineMarket, PositionGroup, Signal, TradeJob, TradingMode,
};
