use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};

use super::dto::*;
use super::error::ApiError;
use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::requests::*;
use crate::fund::FundService;
use crate::markets::{validate_market_id, QuoteRequest, Quote, Venue};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 20_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub funds: FundService,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the API router
pub fn create_router(funds: FundService) -> Router {
    let state = AppState { funds };

    Router::new()
        .route("/health", get(health_check))
        // Funds
        .route("/api/funds", get(list_funds).post(create_fund))
        .route("/api/funds/:fund_id", get(get_fund))
        .route("/api/funds/:fund_id/stage", post(change_stage))
        .route("/api/funds/:fund_id/deposit", post(deposit))
        .route("/api/funds/:fund_id/withdraw", post(withdraw))
        .route("/api/funds/:fund_id/snapshot", post(push_snapshot))
        .route("/api/funds/:fund_id/history", get(get_history))
        .route("/api/funds/:fund_id/depositors", get(list_depositors))
        .route("/api/funds/:fund_id/depositors/:wallet", get(get_depositor))
        .route(
            "/api/funds/:fund_id/performance-fee/collect",
            post(collect_performance_fee),
        )
        .route(
            "/api/funds/:fund_id/withdrawals",
            get(list_withdrawal_requests).post(request_withdrawal),
        )
        .route(
            "/api/funds/:fund_id/withdrawals/:request_id/cancel",
            post(cancel_withdrawal),
        )
        .route(
            "/api/funds/:fund_id/withdrawals/:request_id/process",
            post(process_withdrawal),
        )
        .route("/api/funds/:fund_id/positions", get(list_positions))
        .route("/api/funds/:fund_id/positions/mark", post(mark_position))
        .route("/api/funds/:fund_id/trades", get(list_trades).post(execute_trade))
        .route("/api/funds/:fund_id/trades/record", post(record_trade))
        .route("/api/funds/:fund_id/activity", get(list_activity))
        // Venues
        .route("/api/markets/:venue/markets", get(get_markets))
        .route("/api/markets/:venue/markets/:market_id", get(get_market))
        .route("/api/markets/:venue/markets/:market_id/price", get(get_price))
        .route("/api/markets/:venue/quote", post(get_quote))
        .with_state(state)
}

fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        venues: state.funds.adapters().venues(),
    })
}

async fn list_funds(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<FundListQuery>,
) -> ApiResult<FundsResponse> {
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, MAX_LIMIT);
    let funds = state
        .funds
        .list_funds(params.stage, params.manager.as_deref(), limit)
        .await?;
    let funds: Vec<FundDto> = funds.into_iter().map(Into::into).collect();
    Ok(Json(FundsResponse {
        count: funds.len(),
        funds,
    }))
}

async fn create_fund(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateFundRequest>,
) -> Result<(StatusCode, Json<FundDto>), ApiError> {
    let view = state.funds.create_fund(req.into()).await?;
    Ok((StatusCode::CREATED, Json(view.into())))
}

async fn get_fund(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
) -> ApiResult<FundDto> {
    Ok(Json(state.funds.get_fund(fund_id).await?.into()))
}

/// Start trading, end trading or finalize, selected by `action`.
async fn change_stage(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<StageRequest>,
) -> ApiResult<StageResponse> {
    let response = match req {
        StageRequest::StartTrading { initial_aum_usdc } => {
            let view = state.funds.start_trading(fund_id, initial_aum_usdc).await?;
            StageResponse::Fund(view.into())
        }
        StageRequest::EndTrading => {
            StageResponse::Fund(state.funds.end_trading(fund_id).await?.into())
        }
        StageRequest::Finalize { final_balance_usdc } => {
            let receipt = state.funds.finalize(fund_id, final_balance_usdc).await?;
            StageResponse::Finalized(receipt.into())
        }
    };
    Ok(Json(response))
}

async fn deposit(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<DepositRequest>,
) -> ApiResult<DepositResponse> {
    let receipt = state
        .funds
        .deposit(fund_id, &req.wallet, req.amount_usdc)
        .await?;
    Ok(Json(receipt.into()))
}

async fn withdraw(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<WithdrawRequest>,
) -> ApiResult<WithdrawResponse> {
    let receipt = state.funds.withdraw(fund_id, &req.wallet, req.shares).await?;
    Ok(Json(receipt.into()))
}

/// Indexer push of on-chain figures.
async fn push_snapshot(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<SnapshotRequest>,
) -> ApiResult<SnapshotDto> {
    let snapshot = state.funds.push_snapshot(fund_id, req.into()).await?;
    Ok(Json(snapshot.into()))
}

async fn get_history(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiQuery(params): ApiQuery<LimitQuery>,
) -> ApiResult<HistoryResponse> {
    let limit = clamp_limit(params.limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT);
    let snapshots: Vec<SnapshotDto> = state
        .funds
        .history(fund_id, limit)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(HistoryResponse {
        fund_id,
        count: snapshots.len(),
        snapshots,
    }))
}

async fn list_depositors(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
) -> ApiResult<DepositorsResponse> {
    let depositors: Vec<DepositorDto> = state
        .funds
        .depositors(fund_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(DepositorsResponse {
        fund_id,
        count: depositors.len(),
        depositors,
    }))
}

async fn get_depositor(
    State(state): State<AppState>,
    ApiPath((fund_id, wallet)): ApiPath<(u64, String)>,
) -> ApiResult<DepositorDto> {
    Ok(Json(state.funds.depositor(fund_id, &wallet).await?.into()))
}

async fn collect_performance_fee(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
) -> ApiResult<FundDto> {
    state.funds.collect_performance_fee(fund_id).await?;
    Ok(Json(state.funds.get_fund(fund_id).await?.into()))
}

async fn list_withdrawal_requests(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiQuery(params): ApiQuery<OpenOnlyQuery>,
) -> ApiResult<WithdrawalRequestsResponse> {
    let requests: Vec<WithdrawalRequestDto> = state
        .funds
        .withdrawal_requests(fund_id, params.open_only.unwrap_or(false))
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(WithdrawalRequestsResponse {
        count: requests.len(),
        requests,
    }))
}

async fn request_withdrawal(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<QueueWithdrawalRequest>,
) -> Result<(StatusCode, Json<WithdrawalRequestDto>), ApiError> {
    let request = state
        .funds
        .request_withdrawal(fund_id, &req.wallet, req.shares)
        .await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

async fn cancel_withdrawal(
    State(state): State<AppState>,
    ApiPath((fund_id, request_id)): ApiPath<(u64, i64)>,
    ApiJson(req): ApiJson<CancelWithdrawalRequest>,
) -> ApiResult<WithdrawalRequestDto> {
    let request = state
        .funds
        .cancel_withdrawal(fund_id, request_id, &req.wallet)
        .await?;
    Ok(Json(request.into()))
}

async fn process_withdrawal(
    State(state): State<AppState>,
    ApiPath((fund_id, request_id)): ApiPath<(u64, i64)>,
) -> ApiResult<ProcessedWithdrawalResponse> {
    let processed = state.funds.process_withdrawal(fund_id, request_id).await?;
    Ok(Json(processed.into()))
}

async fn list_positions(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiQuery(params): ApiQuery<OpenOnlyQuery>,
) -> ApiResult<PositionsResponse> {
    let positions = state
        .funds
        .positions(fund_id, params.open_only.unwrap_or(true))
        .await?;
    Ok(Json(positions.try_into()?))
}

async fn mark_position(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<MarkPositionRequest>,
) -> ApiResult<PositionDto> {
    let position = state
        .funds
        .mark_position(fund_id, req.venue, &req.market_id, req.side, req.price)
        .await?;
    Ok(Json(position.try_into()?))
}

async fn list_trades(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiQuery(params): ApiQuery<LimitQuery>,
) -> ApiResult<TradesResponse> {
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, MAX_LIMIT);
    let trades: Vec<TradeDto> = state
        .funds
        .trades(fund_id, limit)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(TradesResponse {
        count: trades.len(),
        trades,
    }))
}

/// Quote through the venue adapter, then book the fill.
async fn execute_trade(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<ExecuteTradeRequest>,
) -> Result<(StatusCode, Json<TradeReceiptResponse>), ApiError> {
    let receipt = state.funds.execute_trade(fund_id, req.into()).await?;
    Ok((StatusCode::CREATED, Json(receipt.try_into()?)))
}

/// Book a fill that was executed elsewhere.
async fn record_trade(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiJson(req): ApiJson<RecordTradeRequest>,
) -> Result<(StatusCode, Json<TradeReceiptResponse>), ApiError> {
    let receipt = state.funds.record_trade(fund_id, req.into()).await?;
    Ok((StatusCode::CREATED, Json(receipt.try_into()?)))
}

async fn list_activity(
    State(state): State<AppState>,
    ApiPath(fund_id): ApiPath<u64>,
    ApiQuery(params): ApiQuery<ActivityQuery>,
) -> ApiResult<ActivityResponse> {
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, MAX_LIMIT);
    let activity: Vec<ActivityDto> = state
        .funds
        .activity(fund_id, params.wallet.as_deref(), limit)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(ActivityResponse {
        count: activity.len(),
        activity,
    }))
}

async fn get_markets(
    State(state): State<AppState>,
    ApiPath(venue): ApiPath<Venue>,
) -> ApiResult<MarketsResponse> {
    let markets = state.funds.adapters().get(venue)?.get_markets().await?;
    Ok(Json(MarketsResponse {
        venue,
        count: markets.len(),
        markets,
    }))
}

async fn get_market(
    State(state): State<AppState>,
    ApiPath((venue, market_id)): ApiPath<(Venue, String)>,
) -> ApiResult<crate::markets::Market> {
    let market_id = validate_market_id(&market_id)?;
    let market = state.funds.adapters().get(venue)?.get_market(market_id).await?;
    Ok(Json(market))
}

async fn get_price(
    State(state): State<AppState>,
    ApiPath((venue, market_id)): ApiPath<(Venue, String)>,
) -> ApiResult<PriceResponse> {
    let market_id = validate_market_id(&market_id)?.to_string();
    let price = state.funds.adapters().get(venue)?.get_price(&market_id).await?;
    Ok(Json(PriceResponse {
        venue,
        market_id,
        price,
    }))
}

async fn get_quote(
    State(state): State<AppState>,
    ApiPath(venue): ApiPath<Venue>,
    ApiJson(mut req): ApiJson<QuoteRequest>,
) -> ApiResult<Quote> {
    req.market_id = validate_market_id(&req.market_id)?.to_string();
    if req.amount == 0 {
        return Err(crate::fund::FundError::validation("amount must be greater than zero").into());
    }
    let quote = state.funds.adapters().get(venue)?.get_quote(&req).await?;
    Ok(Json(quote))
}
