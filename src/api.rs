use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};
use uuid::Uuid;

use crate::accrual::{self, AccrualTerms, ReturnProjection};
use crate::balance::{Balance, WithdrawalError, check_withdrawal, compute_balance};
use crate::config::Config;
use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_AMOUNT, E_BAD_LEVEL, E_BELOW_MINIMUM, E_DB_FAILURE,
    E_INSUFFICIENT_BALANCE, E_MALFORMED_INVESTMENT, E_NOT_FOUND, E_PROFILE_CONFLICT,
    E_SESSION_FAILURE, E_UNAUTHENTICATED, LoadError,
};
use crate::maturity::fallback_cycle_days;
use crate::referral::{
    LevelStatistics, MAX_REFERRAL_DEPTH, ReferralReport, ReferralSummary,
    ReferralViews, referral_link,
};
use crate::registration::{NewRegistration, RegistrationOutcome, register_profile};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::session::SessionRegistry;
use crate::store::{DeviceInfo, IdentityProvider, Location, ReferralStore, SessionSink};
use crate::types::{
    InvestmentStatus, NewWithdrawal, Notification, Profile, Withdrawal, WithdrawalKind,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The relational store.
    pub store: Arc<dyn ReferralStore>,
    /// Resolves bearer tokens to profiles.
    pub identity: Arc<dyn IdentityProvider>,
    /// Per-user referral dashboards.
    pub referrals: Arc<ReferralViews>,
    /// Per-user presence sessions.
    pub sessions: Arc<SessionRegistry>,
    /// The application configuration.
    pub config: Config,
}

impl AppState {
    /// Builds the state around one backend serving every capability.
    pub fn new<B>(backend: Arc<B>, config: Config) -> Self
    where
        B: ReferralStore + IdentityProvider + SessionSink + 'static,
    {
        let store: Arc<dyn ReferralStore> = backend.clone();
        let sink: Arc<dyn SessionSink> = backend.clone();
        Self {
            referrals: Arc::new(ReferralViews::new(
                Arc::clone(&store),
                config.aggregator_settings(),
            )),
            sessions: Arc::new(SessionRegistry::new(sink, config.heartbeat_interval())),
            identity: backend,
            store,
            config,
        }
    }
}

/// The referral link of the caller.
#[derive(Serialize)]
pub struct ReferralLinkResponse {
    /// Empty when the caller has no referral code.
    pub link: String,
}

/// Earnings of one investment as of the request.
#[derive(Serialize)]
pub struct EarningsResponse {
    /// The ID of the investment.
    pub investment_id: Uuid,
    /// The current status.
    pub status: InvestmentStatus,
    /// The amount earned so far.
    pub earned: Decimal,
    /// Whole days since the investment started.
    pub elapsed_days: i64,
    /// The contract term applied.
    pub cycle_days: Option<u32>,
    /// Whether the term is over.
    pub cycle_completed: bool,
    /// Seconds until maturity.
    pub remaining_seconds: Option<i64>,
}

/// Query of a returns projection.
#[derive(Deserialize)]
pub struct ProjectionQuery {
    /// The principal.
    pub amount: Decimal,
    /// The daily rate in percent.
    pub daily_roi: Decimal,
}

/// The request to withdraw from one of the caller's balances.
#[derive(Deserialize)]
pub struct WithdrawalRequest {
    pub kind: WithdrawalKind,
    pub amount: Decimal,
}

/// The request to start tracking the caller's session.
#[derive(Deserialize, Default)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub device: DeviceInfo,
    #[serde(default)]
    pub location: Location,
}

/// The response after starting a session.
#[derive(Serialize)]
pub struct SessionResponse {
    /// The ID of the tracked session.
    pub session_id: Uuid,
}

/// The response after stopping a session.
#[derive(Serialize)]
pub struct StopSessionResponse {
    /// Whether a session was open.
    pub stopped: bool,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/profiles", post(create_profile_handler))
        .route("/me/referrals", get(get_referrals_handler))
        .route("/me/referrals/link", get(get_referral_link_handler))
        .route("/me/referrals/levels/{level}", get(get_level_statistics_handler))
        .route("/me/referrals/tree/{level}", get(get_referral_tree_handler))
        .route("/me/balance", get(get_balance_handler))
        .route("/me/withdrawals", get(list_withdrawals_handler).post(request_withdrawal_handler))
        .route("/me/notifications", get(list_notifications_handler))
        .route("/me/sessions", post(start_session_handler).delete(stop_session_handler))
        .route("/investments/{id}/earnings", get(get_earnings_handler))
        .route("/projections", get(get_projection_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn current_user(
    st: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
) -> Result<Option<Profile>, ApiErrorWithMeta> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    st.identity.current_user(token).await.map_err(|e| {
        ApiError::Internal(e)
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    })
}

async fn require_user(
    st: &AppState,
    headers: &HeaderMap,
    meta: &RequestMeta,
) -> Result<Profile, ApiErrorWithMeta> {
    current_user(st, headers, meta).await?.ok_or_else(|| {
        ApiError::Unauthorized("no authenticated session".into())
            .with_meta(meta.clone())
            .with_code(E_UNAUTHENTICATED)
    })
}

fn check_level(level: u8, meta: &RequestMeta) -> Result<(), ApiErrorWithMeta> {
    if (1..=MAX_REFERRAL_DEPTH).contains(&level) {
        return Ok(());
    }
    Err(
        ApiError::BadRequest(format!("level must be between 1 and {MAX_REFERRAL_DEPTH}"))
            .with_meta(meta.clone())
            .with_code(E_BAD_LEVEL),
    )
}

/// Loads the caller's report. A load cancelled by a concurrent request of
/// the same user answers with what that request commits.
async fn load_report(
    st: &AppState,
    profile: Option<&Profile>,
    meta: &RequestMeta,
) -> Result<ReferralReport, ApiErrorWithMeta> {
    st.referrals
        .load_settled(profile.map(|p| p.id))
        .await
        .map_err(|e| ApiError::from_load(e, meta.clone()))
}

fn db_failure(meta: &RequestMeta) -> impl Fn(anyhow::Error) -> ApiErrorWithMeta + '_ {
    move |e| {
        ApiError::Internal(e)
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    }
}

/// Both balances of `profile` as of now.
async fn load_balance(
    st: &AppState,
    profile: &Profile,
    meta: &RequestMeta,
) -> Result<Balance, ApiErrorWithMeta> {
    let report = load_report(st, Some(profile), meta).await?;
    let fallback = fallback_cycle_days(st.store.as_ref(), st.config.default_cycle_days)
        .await
        .map_err(db_failure(meta))?;
    let investments = st
        .store
        .investments_of(profile.id)
        .await
        .map_err(db_failure(meta))?;
    let withdrawals = st
        .store
        .withdrawals_of(profile.id)
        .await
        .map_err(db_failure(meta))?;
    compute_balance(
        &investments,
        fallback,
        report.total_commission,
        &withdrawals,
        &st.config.withdrawal_limits(),
        Utc::now(),
    )
    .map_err(|e| {
        ApiError::BadGateway(format!("balance of {} cannot be computed: {e}", profile.id))
            .with_meta(meta.clone())
            .with_code(E_MALFORMED_INVESTMENT)
    })
}

async fn create_profile_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewRegistration>,
) -> Result<ApiOk<Profile>, ApiErrorWithMeta> {
    if req.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email is required".into()).with_meta(meta));
    }

    let outcome = register_profile(st.store.as_ref(), req).await.map_err(|e| {
        ApiError::Internal(e)
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    })?;

    match outcome {
        RegistrationOutcome::Created(profile) => {
            Ok(ApiOk::created("profile created", profile, meta))
        }
        RegistrationOutcome::Conflict => Err(ApiError::Conflict("profile already exists".into())
            .with_meta(meta)
            .with_code(E_PROFILE_CONFLICT)),
    }
}

async fn get_referrals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<ReferralReport>, ApiErrorWithMeta> {
    let profile = current_user(&st, &headers, &meta).await?;
    let report = load_report(&st, profile.as_ref(), &meta).await?;
    Ok(ApiOk::ok("referrals loaded", report, meta))
}

async fn get_referral_link_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<ReferralLinkResponse>, ApiErrorWithMeta> {
    let profile = current_user(&st, &headers, &meta).await?;
    let link = referral_link(&st.config.public_origin, profile.as_ref());
    Ok(ApiOk::ok("referral link", ReferralLinkResponse { link }, meta))
}

async fn get_level_statistics_handler(
    State(st): State<AppState>,
    Path(level): Path<u8>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<LevelStatistics>, ApiErrorWithMeta> {
    check_level(level, &meta)?;
    let profile = current_user(&st, &headers, &meta).await?;
    let report = load_report(&st, profile.as_ref(), &meta).await?;
    Ok(ApiOk::ok(
        "level statistics",
        report.level_statistics(level),
        meta,
    ))
}

async fn get_referral_tree_handler(
    State(st): State<AppState>,
    Path(level): Path<u8>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<Vec<ReferralSummary>>, ApiErrorWithMeta> {
    check_level(level, &meta)?;
    let profile = require_user(&st, &headers, &meta).await?;
    let referrals = st
        .referrals
        .referrals_at_level(profile.id, level)
        .await
        .map_err(|e| ApiError::from_load(LoadError::Aggregation(e), meta.clone()))?;
    Ok(ApiOk::ok("referrals at level", referrals, meta))
}

async fn get_earnings_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<EarningsResponse>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let investment = st
        .store
        .investment(id)
        .await
        .map_err(db_failure(&meta))?
        .filter(|i| i.user_id == profile.id)
        .ok_or_else(|| {
            ApiError::NotFound("investment not found".into())
                .with_meta(meta.clone())
                .with_code(E_NOT_FOUND)
        })?;

    let fallback = fallback_cycle_days(st.store.as_ref(), st.config.default_cycle_days)
        .await
        .map_err(db_failure(&meta))?;
    let terms = AccrualTerms::for_investment(&investment, Some(fallback));
    let now = Utc::now();
    let earned = accrual::calculate_earnings(&terms, now).map_err(|e| {
        ApiError::BadGateway(format!("investment {} cannot accrue: {e}", investment.id))
            .with_meta(meta.clone())
            .with_code(E_MALFORMED_INVESTMENT)
    })?;

    Ok(ApiOk::ok(
        "earnings calculated",
        EarningsResponse {
            investment_id: investment.id,
            status: investment.status,
            earned,
            elapsed_days: accrual::elapsed_days(terms.created_at, now),
            cycle_days: terms.cycle_days,
            cycle_completed: accrual::is_cycle_completed(&terms, now),
            remaining_seconds: accrual::time_remaining(&terms, now).map(|d| d.num_seconds()),
        },
        meta,
    ))
}

async fn get_balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<Balance>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let balance = load_balance(&st, &profile, &meta).await?;
    Ok(ApiOk::ok("balance computed", balance, meta))
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<Vec<Withdrawal>>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let withdrawals = st
        .store
        .withdrawals_of(profile.id)
        .await
        .map_err(db_failure(&meta))?;
    Ok(ApiOk::ok("withdrawals listed", withdrawals, meta))
}

async fn request_withdrawal_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(req): Json<WithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let balance = load_balance(&st, &profile, &meta).await?;
    check_withdrawal(&balance, req.kind, req.amount).map_err(|e| {
        let code = match e {
            WithdrawalError::NonPositive(_) => E_BAD_AMOUNT,
            WithdrawalError::BelowMinimum { .. } => E_BELOW_MINIMUM,
            WithdrawalError::Insufficient { .. } => E_INSUFFICIENT_BALANCE,
        };
        ApiError::BadRequest(e.to_string())
            .with_meta(meta.clone())
            .with_code(code)
    })?;

    let new = NewWithdrawal {
        user_id: profile.id,
        kind: req.kind,
        amount: req.amount,
    };
    let credited = balance.account(req.kind).credited;
    let withdrawal = st
        .store
        .request_withdrawal(&new, credited)
        .await
        .map_err(db_failure(&meta))?
        .ok_or_else(|| {
            // a concurrent request drew the balance down first
            ApiError::BadRequest(format!("{} exceeds the available balance", req.amount))
                .with_meta(meta.clone())
                .with_code(E_INSUFFICIENT_BALANCE)
        })?;
    info!(user = %profile.id, kind = req.kind.as_str(), amount = %req.amount, "withdrawal requested");
    Ok(ApiOk::created("withdrawal requested", withdrawal, meta))
}

async fn list_notifications_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<Vec<Notification>>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let notifications = st
        .store
        .notifications_of(profile.id)
        .await
        .map_err(db_failure(&meta))?;
    Ok(ApiOk::ok("notifications listed", notifications, meta))
}

async fn get_projection_handler(
    Query(q): Query<ProjectionQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ReturnProjection>, ApiErrorWithMeta> {
    let projection = accrual::project_returns(q.amount, q.daily_roi).map_err(|e| {
        ApiError::BadRequest(e.to_string())
            .with_meta(meta.clone())
            .with_code(E_BAD_AMOUNT)
    })?;
    Ok(ApiOk::ok("returns projected", projection, meta))
}

async fn start_session_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(req): Json<StartSessionRequest>,
) -> Result<ApiOk<SessionResponse>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let session_id = st
        .sessions
        .start(profile.id, req.device, req.location)
        .await
        .map_err(|e| {
            ApiError::Internal(e)
                .with_meta(meta.clone())
                .with_code(E_SESSION_FAILURE)
        })?;
    Ok(ApiOk::created(
        "session started",
        SessionResponse { session_id },
        meta,
    ))
}

async fn stop_session_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<StopSessionResponse>, ApiErrorWithMeta> {
    let profile = require_user(&st, &headers, &meta).await?;
    let stopped = st.sessions.stop(profile.id).await.map_err(|e| {
        ApiError::Internal(e)
            .with_meta(meta.clone())
            .with_code(E_SESSION_FAILURE)
    })?;
    Ok(ApiOk::ok(
        "session stopped",
        StopSessionResponse { stopped },
        meta,
    ))
}
