//! HTTP surface
//!
//! Every handler answers 200 with the `{success, data|error}` envelope;
//! failures are translated here and never escape as transport errors.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::claim::RewardStatus;
use crate::error::TradeError;
use crate::middleware::{auth_middleware, require_auth, require_wallet};
use crate::referral::BonusResult;
use crate::state::AppState;
use crate::tasks::{self, TaskKind, TaskStatus};
use crate::types::{
    ApiResponse, Balance, ClaimReceipt, ClaimRewardRequest, ClaimTaskRequest, CloseTradeRequest,
    CloseTradeResult, LinkWalletRequest, OpenPosition, OpenTradeRequest, OpenTradeResult,
    PaginatedResponse, PaginationParams, ProcessReferralRequest, RegisterUserRequest,
    RegisteredUser, TradeHistory, UserAccount,
};

type Caller = Option<Extension<UserAccount>>;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health))
        // 用户
        .route("/users/register", post(register_user))
        .route("/users/wallet", post(link_wallet))
        // 交易
        .route("/open-trade", post(open_trade))
        .route("/close-trade", post(close_trade))
        // 奖励
        .route("/claim-reward", post(claim_reward))
        .route("/process-referral-bonus", post(process_referral_bonus))
        .route("/rewards/status", get(get_reward_status))
        .route("/tasks", get(get_tasks))
        .route("/tasks/claim", post(claim_task))
        // 查询
        .route("/balances", get(get_balances))
        .route("/positions", get(get_positions))
        .route("/trades/history", get(get_trade_history))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

const MAX_PAGE: u32 = 200;

fn log_failure(op: &str, e: &TradeError) {
    match e {
        TradeError::Storage(inner) => error!("{} failed: {}", op, inner),
        other => debug!("{} rejected: {}", op, other),
    }
}

fn respond<T: Serialize>(op: &str, result: Result<T, TradeError>) -> Json<ApiResponse<T>> {
    match result {
        Ok(data) => Json(ApiResponse::ok(data)),
        Err(e) => {
            log_failure(op, &e);
            Json(ApiResponse::err(e.user_message()))
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, TradeError> {
    payload
        .map(|Json(input)| input)
        .map_err(|rejection| TradeError::Validation(rejection.body_text()))
}

/// Wallet-linked caller plus a decoded body
fn wallet_request<T>(user: Caller, payload: Result<Json<T>, JsonRejection>) -> Result<(UserAccount, T), TradeError> {
    let user = require_wallet(user)?;
    Ok((user, body(payload)?))
}

/// POST /open-trade - 开仓
pub async fn open_trade(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<OpenTradeRequest>, JsonRejection>,
) -> Json<ApiResponse<OpenTradeResult>> {
    let result = match wallet_request(user, payload) {
        Ok((user, input)) => state.positions().open(&user.id, &input).await,
        Err(e) => Err(e),
    };
    respond("open-trade", result)
}

/// POST /close-trade - 平仓
pub async fn close_trade(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<CloseTradeRequest>, JsonRejection>,
) -> Json<ApiResponse<CloseTradeResult>> {
    let result = match wallet_request(user, payload) {
        Ok((user, input)) => state.positions().close(&user.id, &input.position_id).await,
        Err(e) => Err(e),
    };
    respond("close-trade", result)
}

/// POST /claim-reward - 领取每日奖励
pub async fn claim_reward(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<ClaimRewardRequest>, JsonRejection>,
) -> Json<ApiResponse<ClaimReceipt>> {
    let result = (|| -> Result<ClaimReceipt, TradeError> {
        let (user, input) = wallet_request(user, payload)?;
        let wallet = input
            .wallet_address
            .filter(|w| !w.trim().is_empty())
            .or(user.wallet_address.clone());

        let now = Utc::now();
        let (receipt, claim) = state.claims().claim(&user.id, input.period, wallet.as_deref(), now)?;

        // 推荐奖励失败不影响领取
        state
            .referrals()
            .process_best_effort(&claim.id, claim.amount, &user.id, now);

        Ok(receipt)
    })();
    respond("claim-reward", result)
}

/// Flat envelope for the referral cascade
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralBonusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: BonusResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /process-referral-bonus - 处理推荐奖励
pub async fn process_referral_bonus(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<ProcessReferralRequest>, JsonRejection>,
) -> Json<ReferralBonusResponse> {
    let result = (|| -> Result<BonusResult, TradeError> {
        let (user, input) = wallet_request(user, payload)?;

        let claim = state
            .db
            .get_claim_by_id(&input.claim_id)?
            .filter(|c| c.user_id == user.id)
            .ok_or_else(|| TradeError::NotFound(format!("Claim {}", input.claim_id)))?;

        if let Some(stated) = input.claimed_amount.filter(|a| *a != claim.amount) {
            debug!(
                "Claim {} stated amount {} differs from recorded {}",
                claim.id, stated, claim.amount
            );
        }

        state
            .referrals()
            .process(&claim.id, claim.amount, &user.id, Utc::now())
    })();

    match result {
        Ok(result) => Json(ReferralBonusResponse { success: true, result, error: None }),
        Err(e) => {
            log_failure("process-referral-bonus", &e);
            Json(ReferralBonusResponse {
                success: false,
                result: BonusResult::skipped(),
                error: Some(e.user_message()),
            })
        }
    }
}

/// POST /users/register - 注册用户
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterUserRequest>, JsonRejection>,
) -> Json<ApiResponse<RegisteredUser>> {
    let result = body(payload).and_then(|input| {
        state.register_user(input.wallet_address, input.referrer_id.as_deref(), Utc::now())
    });
    respond("register", result)
}

/// POST /users/wallet - 绑定钱包
pub async fn link_wallet(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<LinkWalletRequest>, JsonRejection>,
) -> Json<ApiResponse<UserAccount>> {
    let result = require_auth(user).and_then(|user| {
        let input = body(payload)?;
        state.link_wallet(&user, input.wallet_address)
    });
    respond("link-wallet", result)
}

/// GET /balances
pub async fn get_balances(State(state): State<Arc<AppState>>, user: Caller) -> Json<ApiResponse<Balance>> {
    let result = require_auth(user).and_then(|user| {
        state
            .db
            .get_balance(&user.id)?
            .ok_or_else(|| TradeError::NotFound(format!("Balance for {}", user.id)))
    });
    respond("balances", result)
}

/// GET /positions
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    user: Caller,
) -> Json<ApiResponse<Vec<OpenPosition>>> {
    let result = require_auth(user).and_then(|user| Ok(state.db.list_open_positions(&user.id)?));
    respond("positions", result)
}

/// GET /trades/history - 历史成交
pub async fn get_trade_history(
    State(state): State<Arc<AppState>>,
    user: Caller,
    params: Result<Query<PaginationParams>, QueryRejection>,
) -> Json<ApiResponse<PaginatedResponse<TradeHistory>>> {
    let result = require_auth(user).and_then(|user| {
        let Query(params) = params.map_err(|r| TradeError::Validation(r.body_text()))?;
        let limit = params.limit.clamp(1, MAX_PAGE);
        let (items, total) = state.db.trade_history(&user.id, limit, params.offset)?;
        Ok(PaginatedResponse {
            items,
            total,
            limit,
            offset: params.offset,
        })
    });
    respond("trade-history", result)
}

/// GET /rewards/status
pub async fn get_reward_status(
    State(state): State<Arc<AppState>>,
    user: Caller,
) -> Json<ApiResponse<RewardStatus>> {
    let result = require_auth(user).and_then(|user| state.claims().status(&user.id, Utc::now()));
    respond("reward-status", result)
}

/// GET /tasks - 每日任务进度
pub async fn get_tasks(State(state): State<Arc<AppState>>, user: Caller) -> Json<ApiResponse<Vec<TaskStatus>>> {
    let result = require_auth(user).and_then(|user| {
        let period = state.trade_clock().current_period(Utc::now());
        tasks::list_tasks(&state.db, &state.config.tasks, &user.id, period)
    });
    respond("tasks", result)
}

/// POST /tasks/claim - 领取任务奖励
pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    user: Caller,
    payload: Result<Json<ClaimTaskRequest>, JsonRejection>,
) -> Json<ApiResponse<Balance>> {
    let result = require_auth(user).and_then(|user| {
        let input = body(payload)?;
        let task = input.task.parse::<TaskKind>().map_err(TradeError::Validation)?;
        let now = Utc::now();
        let period = state.trade_clock().current_period(now);
        tasks::claim_task(&state.db, &state.config.tasks, &user.id, period, task, now)
    });
    respond("claim-task", result)
}

/// GET /health - 健康检查
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Utc::now();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "trade-settlement",
        "version": env!("CARGO_PKG_VERSION"),
        "tradePeriod": state.trade_clock().current_period(now),
        "claimablePeriod": state.claims().clock().claimable_period(now),
    }))
}
