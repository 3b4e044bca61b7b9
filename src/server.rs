use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::db::RuntimeDb;
use crate::discount::{Discount, DiscountStore, NewDiscount};
use crate::error::AppError;
use crate::price::{NewPrice, Price, PriceStore};
use crate::release::ReleaseService;
use crate::reservation::{map_ledger_error, LongrunReservationRequest, OneshotReservationRequest, ReservationService};
use crate::store::{Account, Job, Journal, LedgerStore, TransactionRequest};
use crate::types::{AccountId, JobId, ServiceType, TransactionType};

/// Shared handle every HTTP handler closes over. Built once in
/// `RuntimeState::build` and cloned per request (every field is an `Arc` or
/// otherwise cheap to clone).
#[derive(Clone)]
pub struct AppState {
    config: Config,
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceStore>,
    discounts: Arc<dyn DiscountStore>,
    reservations: Arc<ReservationService>,
    releases: Arc<ReleaseService>,
    sqs_client: aws_sdk_sqs::Client,
    db: Option<Arc<RuntimeDb>>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceStore>,
        discounts: Arc<dyn DiscountStore>,
        reservations: Arc<ReservationService>,
        releases: Arc<ReleaseService>,
        sqs_client: aws_sdk_sqs::Client,
        db: Option<Arc<RuntimeDb>>,
    ) -> Self {
        Self {
            config,
            ledger,
            prices,
            discounts,
            reservations,
            releases,
            sqs_client,
            db,
            started_at: Utc::now(),
        }
    }

    fn queue_name(&self, service_type: ServiceType) -> &str {
        match service_type {
            ServiceType::Oneshot => &self.config.sqs_oneshot_queue_name,
            ServiceType::Longrun => &self.config.sqs_longrun_queue_name,
            ServiceType::Storage => &self.config.sqs_storage_queue_name,
        }
    }

    /// Resolves the queue url and publishes one FIFO message, `MessageGroupId`
    /// pinned to the project so per-project ordering matches the consumer
    /// side (§5 "ordering guarantees").
    async fn publish(&self, service_type: ServiceType, proj_id: AccountId, body: serde_json::Value) -> Result<(), AppError> {
        let queue_name = self.queue_name(service_type).to_string();
        let response = self
            .sqs_client
            .get_queue_url()
            .queue_name(&queue_name)
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("resolving queue url for {queue_name}: {error}")))?;
        let queue_url = response
            .queue_url()
            .ok_or_else(|| AppError::Internal(format!("queue {queue_name} has no url")))?;

        self.sqs_client
            .send_message()
            .queue_url(queue_url)
            .message_group_id(proj_id.to_string())
            .message_deduplication_id(Uuid::new_v4().to_string())
            .message_body(body.to_string())
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("publishing to {queue_name}: {error}")))?;
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/account/system", post(create_system_account))
        .route("/account/virtual-lab", post(create_vlab))
        .route("/account/project", post(create_project))
        .route("/budget/top-up", post(top_up_budget))
        .route("/budget/assign", post(assign_budget))
        .route("/budget/reverse", post(reverse_budget))
        .route("/budget/move", post(move_budget))
        .route("/price", post(create_price))
        .route("/discount", post(create_discount).put(create_discount).get(list_discounts))
        .route("/discount/current", get(current_discount))
        .route("/reservation/oneshot", post(reserve_oneshot))
        .route("/reservation/longrun", post(reserve_longrun))
        .route("/reservation/oneshot/{job_id}", delete(release_oneshot))
        .route("/reservation/longrun/{job_id}", delete(release_longrun))
        .route("/usage/oneshot", post(publish_oneshot_usage))
        .route("/usage/longrun", post(publish_longrun_usage))
        .route("/usage/storage", post(publish_storage_usage))
        .route("/balance/system", get(balance_system))
        .route("/balance/virtual-lab/{vlab_id}", get(balance_vlab))
        .route("/balance/project/{proj_id}", get(balance_project))
        .route("/report/system", get(report_system))
        .route("/report/virtual-lab/{vlab_id}", get(report_vlab))
        .route("/report/project/{proj_id}", get(report_project))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new();
    }
    let allowed = origins.iter().filter_map(|origin| origin.parse().ok()).collect::<Vec<_>>();
    CorsLayer::new().allow_origin(allowed)
}

// ---------------------------------------------------------------------
// accounts
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSystemAccountRequest {
    name: String,
}

async fn create_system_account(
    State(state): State<AppState>,
    Json(body): Json<CreateSystemAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let account = state.ledger.create_system_account(&body.name, Utc::now()).await.map_err(map_ledger_error)?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Debug, Deserialize)]
struct CreateVlabRequest {
    name: String,
    initial_balance: Option<Decimal>,
}

async fn create_vlab(
    State(state): State<AppState>,
    Json(body): Json<CreateVlabRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let account = state
        .ledger
        .create_vlab(&body.name, body.initial_balance, Utc::now())
        .await
        .map_err(map_ledger_error)?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    vlab_id: AccountId,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateProjectResponse {
    project: Account,
    reservation: Account,
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<CreateProjectResponse>), AppError> {
    let (project, reservation) = state
        .ledger
        .create_proj(body.vlab_id, &body.name, Utc::now())
        .await
        .map_err(map_ledger_error)?;
    Ok((StatusCode::CREATED, Json(CreateProjectResponse { project, reservation })))
}

// ---------------------------------------------------------------------
// budget (direct ledger postings outside the job lifecycle)
// ---------------------------------------------------------------------

fn require_positive(amount: Decimal) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidRequest("amount must be positive".to_string()));
    }
    Ok(())
}

async fn post_budget_transaction(
    state: &AppState,
    amount: Decimal,
    debited_from: AccountId,
    credited_to: AccountId,
    transaction_type: TransactionType,
    reason: Option<String>,
) -> Result<Journal, AppError> {
    require_positive(amount)?;
    let mut request = TransactionRequest::new(amount, debited_from, credited_to, Utc::now(), transaction_type);
    if let Some(reason) = reason {
        request = request.with_reason(reason);
    }
    state.ledger.post_transaction(request).await.map_err(map_ledger_error)
}

#[derive(Debug, Deserialize)]
struct TopUpRequest {
    vlab_id: AccountId,
    amount: Decimal,
    reason: Option<String>,
}

async fn top_up_budget(
    State(state): State<AppState>,
    Json(body): Json<TopUpRequest>,
) -> Result<(StatusCode, Json<Journal>), AppError> {
    let sys = state.ledger.get_system_account().await.map_err(map_ledger_error)?;
    let journal = post_budget_transaction(&state, body.amount, sys.id, body.vlab_id, TransactionType::TopUp, body.reason).await?;
    Ok((StatusCode::CREATED, Json(journal)))
}

#[derive(Debug, Deserialize)]
struct AssignBudgetRequest {
    vlab_id: AccountId,
    proj_id: AccountId,
    amount: Decimal,
    reason: Option<String>,
}

async fn assign_budget(
    State(state): State<AppState>,
    Json(body): Json<AssignBudgetRequest>,
) -> Result<(StatusCode, Json<Journal>), AppError> {
    let journal =
        post_budget_transaction(&state, body.amount, body.vlab_id, body.proj_id, TransactionType::AssignBudget, body.reason).await?;
    Ok((StatusCode::CREATED, Json(journal)))
}

#[derive(Debug, Deserialize)]
struct ReverseBudgetRequest {
    proj_id: AccountId,
    vlab_id: AccountId,
    amount: Decimal,
    reason: Option<String>,
}

async fn reverse_budget(
    State(state): State<AppState>,
    Json(body): Json<ReverseBudgetRequest>,
) -> Result<(StatusCode, Json<Journal>), AppError> {
    let journal =
        post_budget_transaction(&state, body.amount, body.proj_id, body.vlab_id, TransactionType::ReverseBudget, body.reason).await?;
    Ok((StatusCode::CREATED, Json(journal)))
}

#[derive(Debug, Deserialize)]
struct MoveBudgetRequest {
    from_proj_id: AccountId,
    to_proj_id: AccountId,
    amount: Decimal,
    reason: Option<String>,
}

async fn move_budget(
    State(state): State<AppState>,
    Json(body): Json<MoveBudgetRequest>,
) -> Result<(StatusCode, Json<Journal>), AppError> {
    let from = state.ledger.get_account(body.from_proj_id).await.map_err(map_ledger_error)?;
    let to = state.ledger.get_account(body.to_proj_id).await.map_err(map_ledger_error)?;
    if from.parent_id != to.parent_id {
        return Err(AppError::InvalidRequest("projects must belong to the same virtual lab".to_string()));
    }
    let journal =
        post_budget_transaction(&state, body.amount, body.from_proj_id, body.to_proj_id, TransactionType::MoveBudget, body.reason)
            .await?;
    Ok((StatusCode::CREATED, Json(journal)))
}

// ---------------------------------------------------------------------
// price / discount catalogs
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatePriceRequest {
    service_type: ServiceType,
    service_subtype: String,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    fixed_cost: Decimal,
    multiplier: Decimal,
    vlab_id: Option<AccountId>,
}

async fn create_price(
    State(state): State<AppState>,
    Json(body): Json<CreatePriceRequest>,
) -> Result<(StatusCode, Json<Price>), AppError> {
    let price = state
        .prices
        .create_price(NewPrice {
            service_type: body.service_type,
            service_subtype: body.service_subtype,
            valid_from: body.valid_from,
            valid_to: body.valid_to,
            fixed_cost: body.fixed_cost,
            multiplier: body.multiplier,
            vlab_id: body.vlab_id,
        })
        .await
        .map_err(|error| AppError::Internal(error.to_string()))?;
    Ok((StatusCode::CREATED, Json(price)))
}

#[derive(Debug, Deserialize)]
struct CreateDiscountRequest {
    vlab_id: AccountId,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    discount: Decimal,
}

async fn create_discount(
    State(state): State<AppState>,
    Json(body): Json<CreateDiscountRequest>,
) -> Result<(StatusCode, Json<Discount>), AppError> {
    let discount = state
        .discounts
        .create_discount(NewDiscount {
            vlab_id: body.vlab_id,
            valid_from: body.valid_from,
            valid_to: body.valid_to,
            discount: body.discount,
        })
        .await
        .map_err(|error| AppError::Internal(error.to_string()))?;
    Ok((StatusCode::CREATED, Json(discount)))
}

#[derive(Debug, Deserialize)]
struct ListDiscountsQuery {
    vlab_id: AccountId,
}

async fn list_discounts(
    State(state): State<AppState>,
    Query(query): Query<ListDiscountsQuery>,
) -> Result<Json<Vec<Discount>>, AppError> {
    let discounts = state.discounts.list_discounts(query.vlab_id).await.map_err(|error| AppError::Internal(error.to_string()))?;
    Ok(Json(discounts))
}

#[derive(Debug, Deserialize)]
struct CurrentDiscountQuery {
    vlab_id: AccountId,
    at: Option<DateTime<Utc>>,
}

async fn current_discount(
    State(state): State<AppState>,
    Query(query): Query<CurrentDiscountQuery>,
) -> Result<Json<Option<Discount>>, AppError> {
    let at = query.at.unwrap_or_else(Utc::now);
    let discount = state
        .discounts
        .get_current_discount(query.vlab_id, at)
        .await
        .map_err(|error| AppError::Internal(error.to_string()))?;
    Ok(Json(discount))
}

// ---------------------------------------------------------------------
// reservation / release
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ReservationResponse {
    job_id: JobId,
    requested_amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct OneshotReservationBody {
    proj_id: AccountId,
    user_id: Option<String>,
    group_id: Option<String>,
    service_subtype: String,
    count: i64,
}

async fn reserve_oneshot(
    State(state): State<AppState>,
    Json(body): Json<OneshotReservationBody>,
) -> Result<(StatusCode, Json<ReservationResponse>), AppError> {
    let outcome = state
        .reservations
        .reserve_oneshot(OneshotReservationRequest {
            proj_id: body.proj_id,
            user_id: body.user_id,
            group_id: body.group_id,
            service_subtype: body.service_subtype,
            count: body.count,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ReservationResponse { job_id: outcome.job_id, requested_amount: outcome.requested_amount }),
    ))
}

#[derive(Debug, Deserialize)]
struct LongrunReservationBody {
    proj_id: AccountId,
    user_id: Option<String>,
    group_id: Option<String>,
    service_subtype: String,
    instances: i64,
    instance_type: Option<String>,
    duration_seconds: i64,
}

async fn reserve_longrun(
    State(state): State<AppState>,
    Json(body): Json<LongrunReservationBody>,
) -> Result<(StatusCode, Json<ReservationResponse>), AppError> {
    let outcome = state
        .reservations
        .reserve_longrun(LongrunReservationRequest {
            proj_id: body.proj_id,
            user_id: body.user_id,
            group_id: body.group_id,
            service_subtype: body.service_subtype,
            instances: body.instances,
            instance_type: body.instance_type,
            duration_seconds: body.duration_seconds,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ReservationResponse { job_id: outcome.job_id, requested_amount: outcome.requested_amount }),
    ))
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    released_amount: Decimal,
}

async fn release_oneshot(State(state): State<AppState>, Path(job_id): Path<JobId>) -> Result<Json<ReleaseResponse>, AppError> {
    let released_amount = state.releases.release(job_id, ServiceType::Oneshot).await?;
    Ok(Json(ReleaseResponse { released_amount }))
}

async fn release_longrun(State(state): State<AppState>, Path(job_id): Path<JobId>) -> Result<Json<ReleaseResponse>, AppError> {
    let released_amount = state.releases.release(job_id, ServiceType::Longrun).await?;
    Ok(Json(ReleaseResponse { released_amount }))
}

// ---------------------------------------------------------------------
// usage ingestion (publishes to the matching SQS FIFO queue; the queue
// consumers in `crate::queue` do the actual accounting)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OneshotUsageRequest {
    subtype: String,
    proj_id: AccountId,
    job_id: JobId,
    count: i64,
    timestamp: Option<i64>,
}

async fn publish_oneshot_usage(State(state): State<AppState>, Json(body): Json<OneshotUsageRequest>) -> Result<StatusCode, AppError> {
    let timestamp = body.timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let payload = json!({
        "type": "oneshot",
        "subtype": body.subtype,
        "proj_id": body.proj_id,
        "job_id": body.job_id,
        "count": body.count,
        "timestamp": timestamp,
    });
    state.publish(ServiceType::Oneshot, body.proj_id, payload).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct LongrunUsageRequest {
    subtype: String,
    proj_id: AccountId,
    job_id: JobId,
    status: String,
    instances: Option<i64>,
    instance_type: Option<String>,
    timestamp: Option<i64>,
}

fn validate_longrun_status(status: &str) -> Result<(), AppError> {
    match status {
        "started" | "running" | "finished" => Ok(()),
        other => Err(AppError::InvalidRequest(format!("unknown longrun status: {other}"))),
    }
}

async fn publish_longrun_usage(State(state): State<AppState>, Json(body): Json<LongrunUsageRequest>) -> Result<StatusCode, AppError> {
    validate_longrun_status(&body.status)?;
    let timestamp = body.timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let payload = json!({
        "type": "longrun",
        "subtype": body.subtype,
        "proj_id": body.proj_id,
        "job_id": body.job_id,
        "status": body.status,
        "instances": body.instances,
        "instance_type": body.instance_type,
        "timestamp": timestamp,
    });
    state.publish(ServiceType::Longrun, body.proj_id, payload).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct StorageUsageRequest {
    proj_id: AccountId,
    size: i64,
    timestamp: Option<i64>,
}

async fn publish_storage_usage(State(state): State<AppState>, Json(body): Json<StorageUsageRequest>) -> Result<StatusCode, AppError> {
    let timestamp = body.timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let payload = json!({
        "type": "storage",
        "subtype": "storage",
        "proj_id": body.proj_id,
        "size": body.size,
        "timestamp": timestamp,
    });
    state.publish(ServiceType::Storage, body.proj_id, payload).await?;
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------
// balance
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BalanceResponse {
    account: Account,
    #[serde(skip_serializing_if = "Option::is_none")]
    projects: Option<Vec<Account>>,
}

async fn balance_system(State(state): State<AppState>) -> Result<Json<BalanceResponse>, AppError> {
    let account = state.ledger.get_system_account().await.map_err(map_ledger_error)?;
    Ok(Json(BalanceResponse { account, projects: None }))
}

#[derive(Debug, Deserialize)]
struct IncludeProjectsQuery {
    include_projects: Option<bool>,
}

async fn balance_vlab(
    State(state): State<AppState>,
    Path(vlab_id): Path<AccountId>,
    Query(query): Query<IncludeProjectsQuery>,
) -> Result<Json<BalanceResponse>, AppError> {
    let account = state.ledger.get_account(vlab_id).await.map_err(map_ledger_error)?;
    let projects = if query.include_projects.unwrap_or(false) {
        Some(state.ledger.list_projects_for_vlab(vlab_id).await.map_err(map_ledger_error)?)
    } else {
        None
    };
    Ok(Json(BalanceResponse { account, projects }))
}

async fn balance_project(State(state): State<AppState>, Path(proj_id): Path<AccountId>) -> Result<Json<BalanceResponse>, AppError> {
    let account = state.ledger.get_account(proj_id).await.map_err(map_ledger_error)?;
    Ok(Json(BalanceResponse { account, projects: None }))
}

// ---------------------------------------------------------------------
// job reports
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        (self.page.unwrap_or(1).max(1), self.page_size.unwrap_or(50).clamp(1, 500))
    }
}

#[derive(Debug, Serialize)]
struct JobReport {
    jobs: Vec<Job>,
    page: u32,
    page_size: u32,
}

fn job_sort_key(job: &Job) -> DateTime<Utc> {
    job.reserved_at.or(job.started_at).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sorts newest-first and takes one page out of an already-gathered job
/// list. Used by the vlab/system rollups, which fan out across several
/// `list_jobs_for_proj` calls and so cannot push pagination to the store.
fn paginate_in_memory(mut jobs: Vec<Job>, page: u32, page_size: u32) -> Vec<Job> {
    jobs.sort_by(|a, b| job_sort_key(b).cmp(&job_sort_key(a)));
    let start = ((page - 1) as usize) * (page_size as usize);
    jobs.into_iter().skip(start).take(page_size as usize).collect()
}

async fn report_project(
    State(state): State<AppState>,
    Path(proj_id): Path<AccountId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<JobReport>, AppError> {
    let (page, page_size) = query.resolve();
    let jobs = state.ledger.list_jobs_for_proj(proj_id, page, page_size).await.map_err(map_ledger_error)?;
    Ok(Json(JobReport { jobs, page, page_size }))
}

async fn report_vlab(
    State(state): State<AppState>,
    Path(vlab_id): Path<AccountId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<JobReport>, AppError> {
    let (page, page_size) = query.resolve();
    let projects = state.ledger.list_projects_for_vlab(vlab_id).await.map_err(map_ledger_error)?;
    let mut jobs = Vec::new();
    for project in projects {
        jobs.extend(state.ledger.list_jobs_for_proj(project.id, 1, page_size).await.map_err(map_ledger_error)?);
    }
    Ok(Json(JobReport { jobs: paginate_in_memory(jobs, page, page_size), page, page_size }))
}

async fn report_system(State(state): State<AppState>, Query(query): Query<PageQuery>) -> Result<Json<JobReport>, AppError> {
    let (page, page_size) = query.resolve();
    let vlabs = state.ledger.list_vlabs().await.map_err(map_ledger_error)?;
    let mut jobs = Vec::new();
    for vlab in vlabs {
        let projects = state.ledger.list_projects_for_vlab(vlab.id).await.map_err(map_ledger_error)?;
        for project in projects {
            jobs.extend(state.ledger.list_jobs_for_proj(project.id, 1, page_size).await.map_err(map_ledger_error)?);
        }
    }
    Ok(Json(JobReport { jobs: paginate_in_memory(jobs, page, page_size), page, page_size }))
}

// ---------------------------------------------------------------------
// ops
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    uptime_seconds: i64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match &state.db {
        Some(db) => match db.get().await {
            Ok(_) => "postgres",
            Err(_) => "postgres_unreachable",
        },
        None => "memory",
    };
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(HealthResponse { status: "ok", store, uptime_seconds })
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: String,
    version: &'static str,
    build_sha: String,
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        build_sha: state.config.build_sha.clone(),
    })
}

async fn root() -> &'static str {
    "accounting service\n"
}
