//! SQLite persistence layer
//!
//! Every mutation that touches more than one row runs in a single
//! `BEGIN IMMEDIATE` transaction, so callers never observe a half-applied
//! open, close, claim or bonus.

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::claim::reward_amount;
use crate::error::StoreError;
use crate::margin::settlement_credit;
use crate::tasks::TaskKind;
use crate::types::{
    Balance, ClaimReceipt, CountedVolumeReason, OpenPosition, RewardClaim, RewardKind, Side,
    Symbol, TradeHistory, UserAccount,
};
use crate::volume::{self, CapResult};

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of the atomic open
#[derive(Debug)]
pub enum OpenOutcome {
    Opened(Balance),
    RateLimited,
    InsufficientFunds { available_usdt: Decimal, available_oil: Decimal },
}

/// Result of the atomic claim
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed { receipt: ClaimReceipt, claim: RewardClaim },
    AlreadyClaimed,
    NothingToClaim,
}

/// Result of the referral bonus cascade
#[derive(Debug, PartialEq)]
pub enum BonusOutcome {
    Paid { referrer_id: String, bonus_amount: Decimal },
    NoReferrer,
    AlreadyProcessed,
}

#[derive(Debug, PartialEq)]
pub enum TaskClaimOutcome {
    Claimed(Balance),
    AlreadyClaimed,
    NotCompleted { progress: Decimal },
}

/// A closing trade before its volume has been capped
#[derive(Debug, Clone)]
pub struct CloseSettlement {
    pub history: TradeHistory,
    /// Weighted volume eligible for the daily cap; `None` when already rejected
    pub eligible_volume: Option<Decimal>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::new(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_tables(&self) -> rusqlite::Result<()> {
        let conn = self.lock();

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                api_key TEXT UNIQUE NOT NULL,
                wallet_address TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT PRIMARY KEY,
                demo_usdt_balance TEXT NOT NULL DEFAULT '0',
                oil_balance TEXT NOT NULL DEFAULT '0',
                kdx_balance TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS open_positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_price_executed TEXT,
                leverage INTEGER NOT NULL,
                margin TEXT NOT NULL,
                position_size TEXT NOT NULL,
                liquidation_price TEXT NOT NULL,
                fee_oil_paid TEXT NOT NULL,
                slippage_rate TEXT NOT NULL,
                opened_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_history (
                id TEXT PRIMARY KEY,
                position_id TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_price_executed TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                margin TEXT NOT NULL,
                position_size TEXT NOT NULL,
                liquidation_price TEXT NOT NULL,
                fee_oil_paid TEXT NOT NULL,
                slippage_rate TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                exit_price_executed TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                open_time_seconds INTEGER NOT NULL,
                counted_volume TEXT NOT NULL,
                counted_volume_reason TEXT,
                period TEXT NOT NULL,
                closed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_volume (
                user_id TEXT NOT NULL,
                period TEXT NOT NULL,
                counted_volume TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, period)
            );

            CREATE TABLE IF NOT EXISTS reward_claims (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                period TEXT NOT NULL,
                amount TEXT NOT NULL,
                volume_score TEXT NOT NULL,
                wallet_address TEXT,
                claimed_at TEXT NOT NULL,
                UNIQUE (user_id, period)
            );

            CREATE TABLE IF NOT EXISTS referrals (
                id TEXT PRIMARY KEY,
                referrer_id TEXT NOT NULL,
                referred_id TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS referral_bonuses (
                id TEXT PRIMARY KEY,
                claim_id TEXT UNIQUE NOT NULL,
                referrer_id TEXT NOT NULL,
                referred_id TEXT NOT NULL,
                claimed_amount TEXT NOT NULL,
                bonus_amount TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_progress (
                user_id TEXT NOT NULL,
                period TEXT NOT NULL,
                task TEXT NOT NULL,
                progress TEXT NOT NULL,
                claimed_at TEXT,
                PRIMARY KEY (user_id, period, task)
            );

            CREATE INDEX IF NOT EXISTS idx_open_positions_user ON open_positions(user_id, opened_at);
            CREATE INDEX IF NOT EXISTS idx_trade_history_user ON trade_history(user_id, closed_at);
            CREATE INDEX IF NOT EXISTS idx_trade_history_opened ON trade_history(user_id, opened_at);
            CREATE INDEX IF NOT EXISTS idx_daily_volume_period ON daily_volume(period);
            CREATE INDEX IF NOT EXISTS idx_users_api_key ON users(api_key);
        "#)?;

        Ok(())
    }

    // ========== User Operations ==========

    /// Insert a user with seeded balances and, optionally, an active referral
    pub fn create_user(
        &self,
        user: &UserAccount,
        starting_usdt: Decimal,
        starting_oil: Decimal,
        referrer_id: Option<&str>,
    ) -> StoreResult<Balance> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO users (id, api_key, wallet_address, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.api_key, user.wallet_address, fmt_ts(user.created_at)],
        )?;

        let balance = Balance {
            user_id: user.id.clone(),
            demo_usdt_balance: starting_usdt,
            oil_balance: starting_oil,
            kdx_balance: Decimal::ZERO,
        };
        write_balance(&tx, &balance, user.created_at)?;

        if let Some(referrer) = referrer_id.filter(|r| *r != user.id) {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![referrer],
                |row| row.get(0),
            )?;
            if exists {
                tx.execute(
                    "INSERT INTO referrals (id, referrer_id, referred_id, status, created_at) VALUES (?1, ?2, ?3, 'active', ?4)",
                    params![Uuid::new_v4().to_string(), referrer, user.id, fmt_ts(user.created_at)],
                )?;
            }
        }

        tx.commit()?;
        Ok(balance)
    }

    pub fn get_user_by_api_key(&self, api_key: &str) -> StoreResult<Option<UserAccount>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id, api_key, wallet_address, created_at FROM users WHERE api_key = ?1",
                params![api_key],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id, api_key, wallet_address, created_at FROM users WHERE id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn link_wallet(&self, user_id: &str, wallet_address: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE users SET wallet_address = ?1 WHERE id = ?2",
            params![wallet_address, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Record a referral after registration (test and admin use)
    pub fn add_referral(&self, referrer_id: &str, referred_id: &str, status: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO referrals (id, referrer_id, referred_id, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                referrer_id,
                referred_id,
                status,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    // ========== Balance Operations ==========

    pub fn get_balance(&self, user_id: &str) -> StoreResult<Option<Balance>> {
        let conn = self.lock();
        Ok(read_balance(&conn, user_id)?)
    }

    // ========== Position Operations ==========

    /// Opens in `[since, ..)` across live and already-closed positions
    pub fn count_recent_opens(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<u32> {
        let conn = self.lock();
        Ok(count_opens_since(&conn, user_id, since)?)
    }

    /// Insert the position and debit margin and fee together.
    /// Rate limit and funds are re-checked under the write lock.
    pub fn open_position(
        &self,
        pos: &OpenPosition,
        rate_window_start: DateTime<Utc>,
        max_opens: u32,
    ) -> StoreResult<OpenOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if count_opens_since(&tx, &pos.user_id, rate_window_start)? >= max_opens {
            return Ok(OpenOutcome::RateLimited);
        }

        let mut balance = read_balance(&tx, &pos.user_id)?.unwrap_or_else(|| Balance {
            user_id: pos.user_id.clone(),
            demo_usdt_balance: Decimal::ZERO,
            oil_balance: Decimal::ZERO,
            kdx_balance: Decimal::ZERO,
        });

        if balance.demo_usdt_balance < pos.margin || balance.oil_balance < pos.fee_oil_paid {
            return Ok(OpenOutcome::InsufficientFunds {
                available_usdt: balance.demo_usdt_balance,
                available_oil: balance.oil_balance,
            });
        }

        tx.execute(
            r#"INSERT INTO open_positions
               (id, user_id, symbol, side, entry_price, entry_price_executed, leverage, margin,
                position_size, liquidation_price, fee_oil_paid, slippage_rate, opened_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                pos.id.to_string(),
                pos.user_id,
                pos.symbol.as_str(),
                pos.side.as_str(),
                pos.entry_price.to_string(),
                pos.entry_price_executed.map(|p| p.to_string()),
                pos.leverage,
                pos.margin.to_string(),
                pos.position_size.to_string(),
                pos.liquidation_price.to_string(),
                pos.fee_oil_paid.to_string(),
                pos.slippage_rate.to_string(),
                fmt_ts(pos.opened_at),
            ],
        )?;

        balance.demo_usdt_balance -= pos.margin;
        balance.oil_balance -= pos.fee_oil_paid;
        write_balance(&tx, &balance, pos.opened_at)?;

        tx.commit()?;
        Ok(OpenOutcome::Opened(balance))
    }

    pub fn get_open_position(&self, user_id: &str, position_id: &Uuid) -> StoreResult<Option<OpenPosition>> {
        let conn = self.lock();
        let pos = conn
            .query_row(
                &format!("SELECT {} FROM open_positions WHERE id = ?1 AND user_id = ?2", POSITION_COLUMNS),
                params![position_id.to_string(), user_id],
                row_to_position,
            )
            .optional()?;
        Ok(pos)
    }

    pub fn list_open_positions(&self, user_id: &str) -> StoreResult<Vec<OpenPosition>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM open_positions WHERE user_id = ?1 ORDER BY opened_at DESC",
            POSITION_COLUMNS
        ))?;
        let positions = stmt
            .query_map(params![user_id], row_to_position)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    /// Convert an open position into history in one transaction:
    /// delete the position, apply capped volume, write history, credit margin + pnl.
    /// Returns `None` if the position was already gone (closed concurrently).
    pub fn settle_close(
        &self,
        settlement: &CloseSettlement,
        daily_cap: Decimal,
    ) -> StoreResult<Option<(TradeHistory, Balance)>> {
        let mut history = settlement.history.clone();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deleted = tx.execute(
            "DELETE FROM open_positions WHERE id = ?1 AND user_id = ?2",
            params![history.position_id.to_string(), history.user_id],
        )?;
        if deleted == 0 {
            return Ok(None);
        }

        if let Some(eligible) = settlement.eligible_volume {
            let cap = apply_volume_cap(&tx, &history.user_id, history.period, eligible, daily_cap, history.closed_at)?;
            let counted = volume::finalize(&cap);
            history.counted_volume = counted.amount;
            history.counted_volume_reason = counted.reason;
        }

        insert_history(&tx, &history)?;

        let mut balance = read_balance(&tx, &history.user_id)?.unwrap_or_else(|| Balance {
            user_id: history.user_id.clone(),
            demo_usdt_balance: Decimal::ZERO,
            oil_balance: Decimal::ZERO,
            kdx_balance: Decimal::ZERO,
        });
        balance.demo_usdt_balance += settlement_credit(history.margin, history.realized_pnl);
        write_balance(&tx, &balance, history.closed_at)?;

        tx.commit()?;
        Ok(Some((history, balance)))
    }

    /// Closed trades, newest first, with total count
    pub fn trade_history(&self, user_id: &str, limit: u32, offset: u32) -> StoreResult<(Vec<TradeHistory>, u32)> {
        let conn = self.lock();

        let total: u32 = conn.query_row(
            "SELECT COUNT(*) FROM trade_history WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trade_history WHERE user_id = ?1 ORDER BY closed_at DESC LIMIT ?2 OFFSET ?3",
            HISTORY_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![user_id, limit, offset], row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((items, total))
    }

    // ========== Volume Operations ==========

    /// Atomic increment-with-ceiling on the user's period total
    pub fn add_counted_volume(
        &self,
        user_id: &str,
        period: NaiveDate,
        amount: Decimal,
        cap: Decimal,
    ) -> StoreResult<CapResult> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = apply_volume_cap(&tx, user_id, period, amount, cap, Utc::now())?;
        tx.commit()?;
        Ok(result)
    }

    pub fn counted_volume(&self, user_id: &str, period: NaiveDate) -> StoreResult<Decimal> {
        let conn = self.lock();
        Ok(user_volume(&conn, user_id, period)?)
    }

    /// Sum of counted volume across all users for a period
    pub fn pool_volume(&self, period: NaiveDate) -> StoreResult<Decimal> {
        let conn = self.lock();
        Ok(total_volume(&conn, period)?)
    }

    // ========== Claim Operations ==========

    pub fn get_claim(&self, user_id: &str, period: NaiveDate) -> StoreResult<Option<RewardClaim>> {
        let conn = self.lock();
        let claim = conn
            .query_row(
                &format!("SELECT {} FROM reward_claims WHERE user_id = ?1 AND period = ?2", CLAIM_COLUMNS),
                params![user_id, fmt_date(period)],
                row_to_claim,
            )
            .optional()?;
        Ok(claim)
    }

    pub fn get_claim_by_id(&self, claim_id: &Uuid) -> StoreResult<Option<RewardClaim>> {
        let conn = self.lock();
        let claim = conn
            .query_row(
                &format!("SELECT {} FROM reward_claims WHERE id = ?1", CLAIM_COLUMNS),
                params![claim_id.to_string()],
                row_to_claim,
            )
            .optional()?;
        Ok(claim)
    }

    /// Compute the share, insert the claim and credit KDX in one transaction.
    /// `UNIQUE(user_id, period)` backs the duplicate check.
    pub fn claim_reward(
        &self,
        user_id: &str,
        period: NaiveDate,
        daily_pool: Decimal,
        wallet_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let period_key = fmt_date(period);

        let existing: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM reward_claims WHERE user_id = ?1 AND period = ?2)",
            params![user_id, period_key],
            |row| row.get(0),
        )?;
        if existing {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let volume_score = user_volume(&tx, user_id, period)?;
        let pool = total_volume(&tx, period)?;
        let amount = reward_amount(volume_score, pool, daily_pool);
        if amount <= Decimal::ZERO {
            return Ok(ClaimOutcome::NothingToClaim);
        }

        let claim = RewardClaim {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            period,
            amount,
            volume_score,
            wallet_address: wallet_address.map(str::to_string),
            claimed_at: now,
        };

        let inserted = tx.execute(
            r#"INSERT INTO reward_claims (id, user_id, period, amount, volume_score, wallet_address, claimed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                claim.id.to_string(),
                claim.user_id,
                period_key,
                claim.amount.to_string(),
                claim.volume_score.to_string(),
                claim.wallet_address,
                fmt_ts(now),
            ],
        );
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            return Err(e.into());
        }

        let balance = credit(&tx, user_id, RewardKind::Kdx, amount, now)?;
        tx.commit()?;

        Ok(ClaimOutcome::Claimed {
            receipt: ClaimReceipt {
                claim_id: claim.id,
                amount,
                new_kdx_balance: balance.kdx_balance,
            },
            claim,
        })
    }

    // ========== Referral Operations ==========

    /// Pay `rate * claimed_amount` to the claimant's active referrer, once per claim
    pub fn process_referral_bonus(
        &self,
        claim_id: &Uuid,
        claimed_amount: Decimal,
        claimant_id: &str,
        rate: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<BonusOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let referrer: Option<String> = tx
            .query_row(
                "SELECT referrer_id FROM referrals WHERE referred_id = ?1 AND status = 'active'",
                params![claimant_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(referrer_id) = referrer else {
            return Ok(BonusOutcome::NoReferrer);
        };

        let processed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM referral_bonuses WHERE claim_id = ?1)",
            params![claim_id.to_string()],
            |row| row.get(0),
        )?;
        if processed {
            return Ok(BonusOutcome::AlreadyProcessed);
        }

        let bonus_amount = claimed_amount * rate;

        let inserted = tx.execute(
            r#"INSERT INTO referral_bonuses (id, claim_id, referrer_id, referred_id, claimed_amount, bonus_amount, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                Uuid::new_v4().to_string(),
                claim_id.to_string(),
                referrer_id,
                claimant_id,
                claimed_amount.to_string(),
                bonus_amount.to_string(),
                fmt_ts(now),
            ],
        );
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Ok(BonusOutcome::AlreadyProcessed);
            }
            return Err(e.into());
        }

        credit(&tx, &referrer_id, RewardKind::Kdx, bonus_amount, now)?;
        tx.commit()?;

        Ok(BonusOutcome::Paid { referrer_id, bonus_amount })
    }

    // ========== Task Operations ==========

    pub fn increment_task_progress(
        &self,
        user_id: &str,
        period: NaiveDate,
        task: TaskKind,
        amount: Decimal,
    ) -> StoreResult<Decimal> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = task_row(&tx, user_id, period, task)?.map(|(p, _)| p).unwrap_or(Decimal::ZERO);
        let updated = current + amount;

        tx.execute(
            r#"INSERT INTO task_progress (user_id, period, task, progress) VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(user_id, period, task) DO UPDATE SET progress = excluded.progress"#,
            params![user_id, fmt_date(period), task.as_str(), updated.to_string()],
        )?;
        tx.commit()?;
        Ok(updated)
    }

    /// (progress, claimed) for a single task
    pub fn task_progress(&self, user_id: &str, period: NaiveDate, task: TaskKind) -> StoreResult<(Decimal, bool)> {
        let conn = self.lock();
        Ok(task_row(&conn, user_id, period, task)?.unwrap_or((Decimal::ZERO, false)))
    }

    pub fn claim_task_reward(
        &self,
        user_id: &str,
        period: NaiveDate,
        task: TaskKind,
        target: Decimal,
        reward: (RewardKind, Decimal),
        now: DateTime<Utc>,
    ) -> StoreResult<TaskClaimOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (progress, claimed) = task_row(&tx, user_id, period, task)?.unwrap_or((Decimal::ZERO, false));
        if claimed {
            return Ok(TaskClaimOutcome::AlreadyClaimed);
        }
        if progress < target {
            return Ok(TaskClaimOutcome::NotCompleted { progress });
        }

        tx.execute(
            "UPDATE task_progress SET claimed_at = ?1 WHERE user_id = ?2 AND period = ?3 AND task = ?4",
            params![fmt_ts(now), user_id, fmt_date(period), task.as_str()],
        )?;
        let (kind, amount) = reward;
        let balance = credit(&tx, user_id, kind, amount, now)?;

        tx.commit()?;
        Ok(TaskClaimOutcome::Claimed(balance))
    }
}

// ========== Transaction helpers ==========

/// The single point where a reward kind is mapped onto a balance column
fn credit(
    conn: &Connection,
    user_id: &str,
    kind: RewardKind,
    amount: Decimal,
    now: DateTime<Utc>,
) -> rusqlite::Result<Balance> {
    let mut balance = read_balance(conn, user_id)?.unwrap_or_else(|| Balance {
        user_id: user_id.to_string(),
        demo_usdt_balance: Decimal::ZERO,
        oil_balance: Decimal::ZERO,
        kdx_balance: Decimal::ZERO,
    });

    let slot = match kind {
        RewardKind::Usdt => &mut balance.demo_usdt_balance,
        RewardKind::Oil => &mut balance.oil_balance,
        RewardKind::Kdx => &mut balance.kdx_balance,
    };
    *slot = (*slot + amount).max(Decimal::ZERO);

    write_balance(conn, &balance, now)?;
    Ok(balance)
}

fn apply_volume_cap(
    tx: &Transaction<'_>,
    user_id: &str,
    period: NaiveDate,
    amount: Decimal,
    cap: Decimal,
    now: DateTime<Utc>,
) -> rusqlite::Result<CapResult> {
    let current = user_volume(tx, user_id, period)?;
    let result = volume::cap_increment(current, amount, cap);

    tx.execute(
        r#"INSERT INTO daily_volume (user_id, period, counted_volume, updated_at) VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(user_id, period) DO UPDATE SET counted_volume = excluded.counted_volume, updated_at = excluded.updated_at"#,
        params![user_id, fmt_date(period), result.total.to_string(), fmt_ts(now)],
    )?;

    Ok(result)
}

fn user_volume(conn: &Connection, user_id: &str, period: NaiveDate) -> rusqlite::Result<Decimal> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT counted_volume FROM daily_volume WHERE user_id = ?1 AND period = ?2",
            params![user_id, fmt_date(period)],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => parse_decimal(&s, 0),
        None => Ok(Decimal::ZERO),
    }
}

fn total_volume(conn: &Connection, period: NaiveDate) -> rusqlite::Result<Decimal> {
    let mut stmt = conn.prepare("SELECT counted_volume FROM daily_volume WHERE period = ?1")?;
    let mut rows = stmt.query(params![fmt_date(period)])?;
    let mut total = Decimal::ZERO;
    while let Some(row) = rows.next()? {
        total += dec_at(row, 0)?;
    }
    Ok(total)
}

fn count_opens_since(conn: &Connection, user_id: &str, since: DateTime<Utc>) -> rusqlite::Result<u32> {
    conn.query_row(
        r#"SELECT
            (SELECT COUNT(*) FROM open_positions WHERE user_id = ?1 AND opened_at >= ?2) +
            (SELECT COUNT(*) FROM trade_history WHERE user_id = ?1 AND opened_at >= ?2)"#,
        params![user_id, fmt_ts(since)],
        |row| row.get(0),
    )
}

fn read_balance(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Balance>> {
    conn.query_row(
        "SELECT user_id, demo_usdt_balance, oil_balance, kdx_balance FROM balances WHERE user_id = ?1",
        params![user_id],
        |row| {
            Ok(Balance {
                user_id: row.get(0)?,
                demo_usdt_balance: dec_at(row, 1)?,
                oil_balance: dec_at(row, 2)?,
                kdx_balance: dec_at(row, 3)?,
            })
        },
    )
    .optional()
}

fn write_balance(conn: &Connection, balance: &Balance, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO balances (user_id, demo_usdt_balance, oil_balance, kdx_balance, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(user_id) DO UPDATE SET
             demo_usdt_balance = excluded.demo_usdt_balance,
             oil_balance = excluded.oil_balance,
             kdx_balance = excluded.kdx_balance,
             updated_at = excluded.updated_at"#,
        params![
            balance.user_id,
            balance.demo_usdt_balance.max(Decimal::ZERO).to_string(),
            balance.oil_balance.max(Decimal::ZERO).to_string(),
            balance.kdx_balance.max(Decimal::ZERO).to_string(),
            fmt_ts(now),
        ],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, h: &TradeHistory) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO trade_history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            HISTORY_COLUMNS
        ),
        params![
            h.id.to_string(),
            h.position_id.to_string(),
            h.user_id,
            h.symbol.as_str(),
            h.side.as_str(),
            h.entry_price.to_string(),
            h.entry_price_executed.to_string(),
            h.leverage,
            h.margin.to_string(),
            h.position_size.to_string(),
            h.liquidation_price.to_string(),
            h.fee_oil_paid.to_string(),
            h.slippage_rate.to_string(),
            fmt_ts(h.opened_at),
            h.exit_price.to_string(),
            h.exit_price_executed.to_string(),
            h.realized_pnl.to_string(),
            h.open_time_seconds,
            h.counted_volume.to_string(),
            h.counted_volume_reason.map(|r| r.as_str()),
            fmt_date(h.period),
            fmt_ts(h.closed_at),
        ],
    )?;
    Ok(())
}

fn task_row(
    conn: &Connection,
    user_id: &str,
    period: NaiveDate,
    task: TaskKind,
) -> rusqlite::Result<Option<(Decimal, bool)>> {
    conn.query_row(
        "SELECT progress, claimed_at FROM task_progress WHERE user_id = ?1 AND period = ?2 AND task = ?3",
        params![user_id, fmt_date(period), task.as_str()],
        |row| Ok((dec_at(row, 0)?, row.get::<_, Option<String>>(1)?.is_some())),
    )
    .optional()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ========== Row mapping ==========

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, entry_price, entry_price_executed, leverage, margin, \
     position_size, liquidation_price, fee_oil_paid, slippage_rate, opened_at";

const HISTORY_COLUMNS: &str = "id, position_id, user_id, symbol, side, entry_price, entry_price_executed, leverage, \
     margin, position_size, liquidation_price, fee_oil_paid, slippage_rate, opened_at, exit_price, \
     exit_price_executed, realized_pnl, open_time_seconds, counted_volume, counted_volume_reason, period, closed_at";

const CLAIM_COLUMNS: &str = "id, user_id, period, amount, volume_score, wallet_address, claimed_at";

fn row_to_user(row: &Row) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        id: row.get(0)?,
        api_key: row.get(1)?,
        wallet_address: row.get(2)?,
        created_at: ts_at(row, 3)?,
    })
}

fn row_to_position(row: &Row) -> rusqlite::Result<OpenPosition> {
    Ok(OpenPosition {
        id: uuid_at(row, 0)?,
        user_id: row.get(1)?,
        symbol: parsed_at::<Symbol>(row, 2)?,
        side: parsed_at::<Side>(row, 3)?,
        entry_price: dec_at(row, 4)?,
        entry_price_executed: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_decimal(&s, 5))
            .transpose()?,
        leverage: row.get(6)?,
        margin: dec_at(row, 7)?,
        position_size: dec_at(row, 8)?,
        liquidation_price: dec_at(row, 9)?,
        fee_oil_paid: dec_at(row, 10)?,
        slippage_rate: dec_at(row, 11)?,
        opened_at: ts_at(row, 12)?,
    })
}

fn row_to_history(row: &Row) -> rusqlite::Result<TradeHistory> {
    Ok(TradeHistory {
        id: uuid_at(row, 0)?,
        position_id: uuid_at(row, 1)?,
        user_id: row.get(2)?,
        symbol: parsed_at::<Symbol>(row, 3)?,
        side: parsed_at::<Side>(row, 4)?,
        entry_price: dec_at(row, 5)?,
        entry_price_executed: dec_at(row, 6)?,
        leverage: row.get(7)?,
        margin: dec_at(row, 8)?,
        position_size: dec_at(row, 9)?,
        liquidation_price: dec_at(row, 10)?,
        fee_oil_paid: dec_at(row, 11)?,
        slippage_rate: dec_at(row, 12)?,
        opened_at: ts_at(row, 13)?,
        exit_price: dec_at(row, 14)?,
        exit_price_executed: dec_at(row, 15)?,
        realized_pnl: dec_at(row, 16)?,
        open_time_seconds: row.get(17)?,
        counted_volume: dec_at(row, 18)?,
        counted_volume_reason: row
            .get::<_, Option<String>>(19)?
            .map(|s| CountedVolumeReason::from_str(&s).map_err(|e| conversion_error(19, e)))
            .transpose()?,
        period: date_at(row, 20)?,
        closed_at: ts_at(row, 21)?,
    })
}

fn row_to_claim(row: &Row) -> rusqlite::Result<RewardClaim> {
    Ok(RewardClaim {
        id: uuid_at(row, 0)?,
        user_id: row.get(1)?,
        period: date_at(row, 2)?,
        amount: dec_at(row, 3)?,
        volume_score: dec_at(row, 4)?,
        wallet_address: row.get(5)?,
        claimed_at: ts_at(row, 6)?,
    })
}

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_decimal(raw: &str, idx: usize) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn dec_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    parse_decimal(&row.get::<_, String>(idx)?, idx)
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e.to_string()))
}

fn ts_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&row.get::<_, String>(idx)?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn date_at(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&row.get::<_, String>(idx)?, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn parsed_at<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    T::from_str(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
}

/// Fixed-width UTC timestamps so text comparison orders correctly
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn user(db: &Database, id: &str, usdt: Decimal, oil: Decimal) {
        let account = UserAccount {
            id: id.to_string(),
            api_key: format!("ak_{}", id),
            wallet_address: Some(format!("0x{}", id)),
            created_at: Utc::now(),
        };
        db.create_user(&account, usdt, oil, None).unwrap();
    }

    #[test]
    fn test_undecodable_balance_is_corrupt_row() {
        let db = Database::in_memory().unwrap();
        user(&db, "alice", dec!(10000), dec!(1000));
        db.lock()
            .execute("UPDATE balances SET oil_balance = 'lots' WHERE user_id = 'alice'", [])
            .unwrap();

        match db.get_balance("alice") {
            Err(StoreError::Corrupt(msg)) => assert!(msg.starts_with("column 2"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_user_seeds_balance_and_referral() {
        let db = Database::in_memory().unwrap();
        user(&db, "alice", dec!(10000), dec!(1000));

        let bob = UserAccount {
            id: "bob".to_string(),
            api_key: "ak_bob".to_string(),
            wallet_address: None,
            created_at: Utc::now(),
        };
        db.create_user(&bob, dec!(10000), dec!(1000), Some("alice")).unwrap();

        let fetched = db.get_user_by_api_key("ak_bob").unwrap().unwrap();
        assert_eq!(fetched.id, "bob");
        assert!(fetched.wallet_address.is_none());
        assert!(db.link_wallet("bob", "0xb0b").unwrap());
        assert_eq!(db.get_user("bob").unwrap().unwrap().wallet_address.as_deref(), Some("0xb0b"));

        let balance = db.get_balance("alice").unwrap().unwrap();
        assert_eq!(balance.demo_usdt_balance, dec!(10000));
        assert_eq!(balance.kdx_balance, Decimal::ZERO);
    }

    #[test]
    fn test_volume_cap_truncates() {
        let db = Database::in_memory().unwrap();
        let period = date("2024-03-01");

        let first = db.add_counted_volume("alice", period, dec!(49900), dec!(50000)).unwrap();
        assert_eq!(first.applied, dec!(49900));
        assert!(!first.truncated);

        let second = db.add_counted_volume("alice", period, dec!(1000), dec!(50000)).unwrap();
        assert_eq!(second.applied, dec!(100));
        assert!(second.truncated);

        let third = db.add_counted_volume("alice", period, dec!(1000), dec!(50000)).unwrap();
        assert_eq!(third.applied, Decimal::ZERO);
        assert!(third.truncated);
        assert_eq!(db.counted_volume("alice", period).unwrap(), dec!(50000));

        // next period starts fresh
        let next = db.add_counted_volume("alice", date("2024-03-02"), dec!(1000), dec!(50000)).unwrap();
        assert_eq!(next.applied, dec!(1000));
    }

    #[test]
    fn test_concurrent_volume_never_exceeds_cap() {
        let db = Arc::new(Database::in_memory().unwrap());
        let period = date("2024-03-01");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    db.add_counted_volume("alice", period, dec!(10000), dec!(50000)).unwrap().applied
                })
            })
            .collect();

        let applied: Decimal = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(applied, dec!(50000));
        assert_eq!(db.counted_volume("alice", period).unwrap(), dec!(50000));
    }

    #[test]
    fn test_claim_reward_once() {
        let db = Database::in_memory().unwrap();
        user(&db, "alice", dec!(10000), dec!(1000));
        let period = date("2024-03-01");
        db.add_counted_volume("alice", period, dec!(3000), dec!(50000)).unwrap();
        db.add_counted_volume("bob", period, dec!(1000), dec!(50000)).unwrap();

        let outcome = db.claim_reward("alice", period, dec!(10000), None, Utc::now()).unwrap();
        match outcome {
            ClaimOutcome::Claimed { receipt, claim } => {
                assert_eq!(receipt.amount, dec!(7500));
                assert_eq!(receipt.new_kdx_balance, dec!(7500));
                assert_eq!(claim.volume_score, dec!(3000));
            }
            other => panic!("unexpected {:?}", other),
        }

        let again = db.claim_reward("alice", period, dec!(10000), None, Utc::now()).unwrap();
        assert!(matches!(again, ClaimOutcome::AlreadyClaimed));
        assert_eq!(db.get_balance("alice").unwrap().unwrap().kdx_balance, dec!(7500));
    }

    #[test]
    fn test_concurrent_claims_credit_once() {
        let db = Arc::new(Database::in_memory().unwrap());
        user(&db, "alice", dec!(10000), dec!(1000));
        let period = date("2024-03-01");
        db.add_counted_volume("alice", period, dec!(500), dec!(50000)).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    matches!(
                        db.claim_reward("alice", period, dec!(10000), None, Utc::now()).unwrap(),
                        ClaimOutcome::Claimed { .. }
                    )
                })
            })
            .collect();

        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(wins, 1);
        assert_eq!(db.get_balance("alice").unwrap().unwrap().kdx_balance, dec!(10000));
    }

    #[test]
    fn test_claim_without_volume() {
        let db = Database::in_memory().unwrap();
        let outcome = db
            .claim_reward("alice", date("2024-03-01"), dec!(10000), None, Utc::now())
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::NothingToClaim));
    }

    #[test]
    fn test_referral_bonus_exactly_once() {
        let db = Database::in_memory().unwrap();
        user(&db, "referrer", dec!(0), dec!(0));
        db.add_referral("referrer", "alice", "active").unwrap();
        let claim_id = Uuid::new_v4();

        let first = db
            .process_referral_bonus(&claim_id, dec!(1000), "alice", dec!(0.08), Utc::now())
            .unwrap();
        assert_eq!(
            first,
            BonusOutcome::Paid { referrer_id: "referrer".to_string(), bonus_amount: dec!(80) }
        );

        let second = db
            .process_referral_bonus(&claim_id, dec!(1000), "alice", dec!(0.08), Utc::now())
            .unwrap();
        assert_eq!(second, BonusOutcome::AlreadyProcessed);
        assert_eq!(db.get_balance("referrer").unwrap().unwrap().kdx_balance, dec!(80));
    }

    #[test]
    fn test_referral_creates_missing_balance_row() {
        let db = Database::in_memory().unwrap();
        db.add_referral("ghost", "alice", "active").unwrap();
        db.process_referral_bonus(&Uuid::new_v4(), dec!(50), "alice", dec!(0.08), Utc::now())
            .unwrap();
        assert_eq!(db.get_balance("ghost").unwrap().unwrap().kdx_balance, dec!(4));
    }

    #[test]
    fn test_inactive_referral_is_ignored() {
        let db = Database::in_memory().unwrap();
        db.add_referral("referrer", "alice", "revoked").unwrap();
        let outcome = db
            .process_referral_bonus(&Uuid::new_v4(), dec!(1000), "alice", dec!(0.08), Utc::now())
            .unwrap();
        assert_eq!(outcome, BonusOutcome::NoReferrer);
    }

    #[test]
    fn test_task_claim_requires_target() {
        let db = Database::in_memory().unwrap();
        user(&db, "alice", dec!(0), dec!(0));
        let period = date("2024-03-01");

        db.increment_task_progress("alice", period, TaskKind::TradeCount, dec!(2)).unwrap();
        let early = db
            .claim_task_reward("alice", period, TaskKind::TradeCount, dec!(3), (RewardKind::Oil, dec!(100)), Utc::now())
            .unwrap();
        assert_eq!(early, TaskClaimOutcome::NotCompleted { progress: dec!(2) });

        db.increment_task_progress("alice", period, TaskKind::TradeCount, dec!(1)).unwrap();
        let done = db
            .claim_task_reward("alice", period, TaskKind::TradeCount, dec!(3), (RewardKind::Oil, dec!(100)), Utc::now())
            .unwrap();
        match done {
            TaskClaimOutcome::Claimed(balance) => assert_eq!(balance.oil_balance, dec!(100)),
            other => panic!("unexpected {:?}", other),
        }

        let again = db
            .claim_task_reward("alice", period, TaskKind::TradeCount, dec!(3), (RewardKind::Oil, dec!(100)), Utc::now())
            .unwrap();
        assert_eq!(again, TaskClaimOutcome::AlreadyClaimed);
    }
}
