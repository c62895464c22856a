use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::Config;
use crate::engine::{CommissionEngine, IntakeReport, UserReferralView};
use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_AMOUNT, E_BAD_REFERRER, E_BAD_REQUEST, E_COMMISSION_RETRY,
    E_DB_FAILURE,
};
use crate::ledger::AppendOutcome;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::settings::{ConfigSnapshot, Settings, TierTable};
use crate::store::CommissionStore;
use crate::types::{CompletedOrder, HistoryQuery, OrderAmount, OrderId, Page, ReferrerRef, UserId};

/// The application state.
#[derive(Clone)]
pub struct AppState<S> {
    /// The commission engine over the configured store.
    pub engine: CommissionEngine<S>,
    /// The application configuration.
    pub config: Config,
}

impl<S: CommissionStore> AppState<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            engine: CommissionEngine::new(store, config.referral_link_base.as_str()),
            config,
        }
    }
}

/// An order-completion event from the checkout system. Exactly one of
/// `net_amount` and `gross_amount` must be set.
#[derive(Deserialize)]
pub struct OrderCompletedRequest {
    /// The ID of the order.
    pub order_id: OrderId,
    /// The ID of the user who placed the order.
    pub buyer_id: UserId,
    /// The amount after the payment gateway fee.
    pub net_amount: Option<i64>,
    /// The amount before the payment gateway fee.
    pub gross_amount: Option<i64>,
    /// When the order completed. Defaults to now.
    pub completed_at: Option<DateTime<Utc>>,
}

/// The request to register a user. At most one of `referred_by` and
/// `referral_code` may be set.
#[derive(Deserialize)]
pub struct RegisterUserRequest {
    /// The ID of the new user.
    pub user_id: UserId,
    /// The ID of the user who referred them.
    pub referred_by: Option<UserId>,
    /// The referral code they signed up with.
    pub referral_code: Option<String>,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    #[serde(alias = "per_page")]
    pub limit: Option<u32>,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryGrouping {
    Order,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub page: Option<u32>,
    #[serde(alias = "per_page")]
    pub limit: Option<u32>,
    /// Only entries older than this entry id.
    pub before: Option<i64>,
    pub group: Option<HistoryGrouping>,
}

/// The current settings version.
#[derive(Serialize)]
pub struct SettingsResponse {
    pub version: i64,
    pub settings: Settings,
    pub updated_at: DateTime<Utc>,
}

/// The current tier table version.
#[derive(Serialize)]
pub struct TierTableResponse {
    pub version: i64,
    pub tiers: TierTable,
    pub updated_at: DateTime<Utc>,
}

impl From<&ConfigSnapshot> for SettingsResponse {
    fn from(s: &ConfigSnapshot) -> Self {
        Self {
            version: s.version,
            settings: s.settings.clone(),
            updated_at: s.created_at,
        }
    }
}

impl From<&ConfigSnapshot> for TierTableResponse {
    fn from(s: &ConfigSnapshot) -> Self {
        Self {
            version: s.version,
            tiers: s.tiers.clone(),
            updated_at: s.created_at,
        }
    }
}

pub fn init_router<S: CommissionStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/orders/completed", post(order_completed_handler::<S>))
        .route(
            "/orders/{order_id}/reversal",
            post(reverse_order_handler::<S>),
        )
        .route(
            "/referrals/settings",
            get(get_settings_handler::<S>).put(update_settings_handler::<S>),
        )
        .route(
            "/referrals/tiers",
            get(get_tiers_handler::<S>).put(update_tiers_handler::<S>),
        )
        .route(
            "/referrals/users",
            get(list_users_handler::<S>).post(register_user_handler::<S>),
        )
        .route("/referrals/users/{user_id}", get(get_user_handler::<S>))
        .route(
            "/referrals/commissions",
            get(list_commissions_handler::<S>),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn order_completed_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<OrderCompletedRequest>,
) -> Result<ApiOk<IntakeReport>, ApiErrorWithMeta> {
    if req.order_id.trim().is_empty() {
        return Err(ApiError::BadRequest("order_id must not be empty".into())
            .with_meta(meta)
            .with_code(E_BAD_REQUEST));
    }
    let amount = match (req.net_amount, req.gross_amount) {
        (Some(net), None) => OrderAmount::Net(net),
        (None, Some(gross)) => OrderAmount::Gross(gross),
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of net_amount and gross_amount is required".into(),
            )
            .with_meta(meta)
            .with_code(E_BAD_AMOUNT));
        }
    };

    let order = CompletedOrder {
        order_id: req.order_id,
        buyer_id: req.buyer_id,
        amount,
        completed_at: req.completed_at.unwrap_or_else(Utc::now),
    };
    let report = st
        .engine
        .on_order_completed(order)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_COMMISSION_RETRY, true))?;

    let message = if report.ledger_written {
        "order commissions recorded"
    } else {
        "order already processed"
    };
    Ok(ApiOk::ok(message, report, meta))
}

async fn reverse_order_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Path(order_id): Path<OrderId>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AppendOutcome>, ApiErrorWithMeta> {
    let outcome = st
        .engine
        .reverse_order(&order_id)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_COMMISSION_RETRY, true))?;
    Ok(ApiOk::ok("order commissions reversed", outcome, meta))
}

async fn get_settings_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<SettingsResponse>, ApiErrorWithMeta> {
    let snapshot = st
        .engine
        .settings()
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::ok(
        "settings fetched",
        SettingsResponse::from(snapshot.as_ref()),
        meta,
    ))
}

async fn update_settings_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
    Json(settings): Json<Settings>,
) -> Result<ApiOk<SettingsResponse>, ApiErrorWithMeta> {
    let snapshot = st
        .engine
        .update_settings(settings)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::ok(
        "settings updated",
        SettingsResponse::from(snapshot.as_ref()),
        meta,
    ))
}

async fn get_tiers_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<TierTableResponse>, ApiErrorWithMeta> {
    let snapshot = st
        .engine
        .settings()
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::ok(
        "tier table fetched",
        TierTableResponse::from(snapshot.as_ref()),
        meta,
    ))
}

async fn update_tiers_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
    Json(tiers): Json<TierTable>,
) -> Result<ApiOk<TierTableResponse>, ApiErrorWithMeta> {
    let snapshot = st
        .engine
        .update_tier_table(tiers)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::ok(
        "tier table updated",
        TierTableResponse::from(snapshot.as_ref()),
        meta,
    ))
}

async fn register_user_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<ApiOk<UserReferralView>, ApiErrorWithMeta> {
    let referrer = match (req.referred_by, req.referral_code) {
        (None, None) => None,
        (Some(id), None) => Some(ReferrerRef::User(id)),
        (None, Some(code)) => Some(ReferrerRef::Code(code)),
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "give either referred_by or referral_code, not both".into(),
            )
            .with_meta(meta)
            .with_code(E_BAD_REFERRER));
        }
    };
    let user = st
        .engine
        .register_user(req.user_id, referrer)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::created("user registered", user, meta))
}

async fn list_users_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Query(params): Query<ListParams>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<UserReferralView>>, ApiErrorWithMeta> {
    let page = Page::new(params.page, params.limit);
    let listing = st
        .engine
        .list_user_referral_data(page)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::page("referral users fetched", listing, page, meta))
}

async fn get_user_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Path(user_id): Path<UserId>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<UserReferralView>, ApiErrorWithMeta> {
    let user = st
        .engine
        .user_referral(user_id)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::ok("referral user fetched", user, meta))
}

async fn list_commissions_handler<S: CommissionStore>(
    State(st): State<AppState<S>>,
    Query(params): Query<HistoryParams>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<Response, ApiErrorWithMeta> {
    let query = HistoryQuery {
        page: Page::new(params.page, params.limit),
        before: params.before,
    };

    if params.group == Some(HistoryGrouping::Order) {
        let listing = st
            .engine
            .list_commission_history_grouped(&query)
            .await
            .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
        return Ok(
            ApiOk::page("commission history fetched", listing, query.page, meta).into_response(),
        );
    }

    let listing = st
        .engine
        .list_commission_history(&query)
        .await
        .map_err(|e| e.into_api(meta.clone(), E_DB_FAILURE, false))?;
    Ok(ApiOk::page("commission history fetched", listing, query.page, meta).into_response())
}
