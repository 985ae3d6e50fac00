//! Daily trading tasks
//!
//! Counters advance on every close and are keyed on the trade period.
//! Progress updates are best-effort; a completed task pays once per period.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::TaskConfig;
use crate::db::{Database, TaskClaimOutcome};
use crate::error::TradeError;
use crate::types::{Balance, RewardKind};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TradeCount,
    TradeVolume,
    WinCount,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::TradeCount, TaskKind::TradeVolume, TaskKind::WinCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TradeCount => "trade_count",
            TaskKind::TradeVolume => "trade_volume",
            TaskKind::WinCount => "win_count",
        }
    }

    pub fn target(&self, config: &TaskConfig) -> Decimal {
        match self {
            TaskKind::TradeCount => config.trade_count_target,
            TaskKind::TradeVolume => config.trade_volume_target,
            TaskKind::WinCount => config.win_count_target,
        }
    }

    pub fn reward(&self, config: &TaskConfig) -> (RewardKind, Decimal) {
        match self {
            TaskKind::TradeCount => config.trade_count_reward,
            TaskKind::TradeVolume => config.trade_volume_reward,
            TaskKind::WinCount => config.win_count_reward,
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown task: {}", s))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task: TaskKind,
    pub progress: Decimal,
    pub target: Decimal,
    pub reward_kind: RewardKind,
    pub reward_amount: Decimal,
    pub completed: bool,
    pub claimed: bool,
}

/// Advance the three counters for one closed trade. Failures are logged, never returned.
pub fn record_close(db: &Database, user_id: &str, period: NaiveDate, notional: Decimal, realized_pnl: Decimal) {
    let mut updates = vec![
        (TaskKind::TradeCount, Decimal::ONE),
        (TaskKind::TradeVolume, notional),
    ];
    if realized_pnl > Decimal::ZERO {
        updates.push((TaskKind::WinCount, Decimal::ONE));
    }

    for (task, amount) in updates {
        if let Err(e) = db.increment_task_progress(user_id, period, task, amount) {
            warn!("Task progress update failed (user={}, task={}): {}", user_id, task.as_str(), e);
        }
    }
}

pub fn list_tasks(db: &Database, config: &TaskConfig, user_id: &str, period: NaiveDate) -> Result<Vec<TaskStatus>, TradeError> {
    TaskKind::ALL
        .into_iter()
        .map(|task| -> Result<TaskStatus, TradeError> {
            let (progress, claimed) = db.task_progress(user_id, period, task)?;
            let target = task.target(config);
            let (reward_kind, reward_amount) = task.reward(config);
            Ok(TaskStatus {
                task,
                progress,
                target,
                reward_kind,
                reward_amount,
                completed: progress >= target,
                claimed,
            })
        })
        .collect()
}

pub fn claim_task(
    db: &Database,
    config: &TaskConfig,
    user_id: &str,
    period: NaiveDate,
    task: TaskKind,
    now: DateTime<Utc>,
) -> Result<Balance, TradeError> {
    let target = task.target(config);
    match db.claim_task_reward(user_id, period, task, target, task.reward(config), now)? {
        TaskClaimOutcome::Claimed(balance) => {
            info!("Task {} claimed by {} for {}", task.as_str(), user_id, period);
            Ok(balance)
        }
        TaskClaimOutcome::AlreadyClaimed => Err(TradeError::AlreadyClaimed(format!("{} task {}", period, task.as_str()))),
        TaskClaimOutcome::NotCompleted { progress } => Err(TradeError::Validation(format!(
            "Task {} not completed: {} / {}",
            task.as_str(),
            progress,
            target
        ))),
    }
}
