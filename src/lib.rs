//! Trade Settlement - demo futures positions, volume accounting and KDX rewards
//!
//! Positions are opened and closed against an external mark price with
//! slippage; closed trades feed a capped daily volume score that decides
//! each user's share of the daily reward pool.

pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod margin;
pub mod middleware;
pub mod period;
pub mod position;
pub mod price_feed;
pub mod referral;
pub mod slippage;
pub mod state;
pub mod tasks;
pub mod types;
pub mod volume;

pub use config::Config;
pub use error::TradeError;
pub use state::AppState;
