use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use mbc_sdk::{
    CommandInput, CommandRecord, Cqrs, CsvImportRequest, DataRecord, HistoryRecord, ImportJob,
    InvokeContext, JobFailure, JobStatus, Page, PartialUpdate, PartitionQuery, PublishMode,
    SingleImportRequest, ZipImportRequest,
};

use crate::error::{ServerError, ServerResult};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub cqrs: Arc<Cqrs>,
}

impl AppState {
    pub fn new(cqrs: Arc<Cqrs>) -> Self {
        Self { cqrs }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller attribution taken from `x-user-id`, `x-forwarded-for` and
/// `x-request-id`.
pub fn invoke_context(headers: &HeaderMap) -> InvokeContext {
    let user = header(headers, "x-user-id").unwrap_or("anonymous");
    let ip = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown");
    let mut ctx = InvokeContext::new(user, ip);
    if let Some(request_id) = header(headers, "x-request-id") {
        ctx.request_id = request_id.to_string();
    }
    ctx
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Queued jobs are accepted, finished ones are plain results.
fn job_response(job: ImportJob) -> (StatusCode, Json<ImportJob>) {
    let status = if job.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(job))
}

// ---- Service ----

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn info_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "mbc-server",
        "version": env!("CARGO_PKG_VERSION"),
        "handlers": state.cqrs.handler_names(),
        "tables": state.cqrs.import_tables(),
        "pendingEvents": state.cqrs.pending_events(),
    }))
}

// ---- Commands ----

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(flatten)]
    pub input: CommandInput,
    #[serde(default)]
    pub mode: PublishMode,
}

#[derive(Debug, Deserialize)]
pub struct PartialUpdateRequest {
    #[serde(flatten)]
    pub update: PartialUpdate,
    #[serde(default)]
    pub mode: PublishMode,
}

pub async fn publish_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> ServerResult<(StatusCode, Json<CommandRecord>)> {
    let ctx = invoke_context(&headers);
    let record = state.cqrs.publish(request.input, &ctx, request.mode).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn partial_update_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PartialUpdateRequest>,
) -> ServerResult<Json<CommandRecord>> {
    let ctx = invoke_context(&headers);
    let record = state
        .cqrs
        .publish_partial_update(request.update, &ctx, request.mode)
        .await?;
    Ok(Json(record))
}

// ---- Reads ----

pub async fn get_item_handler(
    State(state): State<AppState>,
    Path((pk, sk)): Path<(String, String)>,
) -> ServerResult<Json<DataRecord>> {
    state
        .cqrs
        .get_item(&pk, &sk)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("{pk} / {sk}")))
}

pub async fn list_items_handler(
    State(state): State<AppState>,
    Path(pk): Path<String>,
    Query(query): Query<PartitionQuery>,
) -> ServerResult<Json<Page<DataRecord>>> {
    Ok(Json(state.cqrs.list_items(&pk, &query)?))
}

pub async fn list_versions_handler(
    State(state): State<AppState>,
    Path((pk, sk)): Path<(String, String)>,
) -> ServerResult<Json<Vec<HistoryRecord>>> {
    Ok(Json(state.cqrs.list_versions(&pk, &sk)?))
}

pub async fn get_version_handler(
    State(state): State<AppState>,
    Path((pk, sk, version)): Path<(String, String, u64)>,
) -> ServerResult<Json<HistoryRecord>> {
    state
        .cqrs
        .get_version(&pk, &sk, version)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("{pk} / {sk} v{version}")))
}

// ---- Imports ----

pub async fn import_single_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SingleImportRequest>,
) -> ServerResult<(StatusCode, Json<ImportJob>)> {
    let ctx = invoke_context(&headers);
    Ok(job_response(state.cqrs.import_single(request, &ctx).await?))
}

pub async fn import_csv_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CsvImportRequest>,
) -> ServerResult<(StatusCode, Json<ImportJob>)> {
    let ctx = invoke_context(&headers);
    Ok(job_response(state.cqrs.import_csv(request, &ctx).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipParams {
    pub tenant_code: String,
    /// Comma-separated table per archive entry, in archive order.
    pub tables: Option<String>,
    pub task_token: Option<String>,
}

pub async fn import_zip_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ZipParams>,
    body: Bytes,
) -> ServerResult<(StatusCode, Json<ImportJob>)> {
    if body.is_empty() {
        return Err(ServerError::BadRequest("empty archive".into()));
    }
    let ctx = invoke_context(&headers);
    let request = ZipImportRequest {
        tenant_code: params.tenant_code,
        archive: body.to_vec(),
        tables: params.tables.as_deref().map(|t| split_list(Some(t))),
        task_token: params.task_token,
    };
    Ok(job_response(state.cqrs.import_zip(request, &ctx).await?))
}

// ---- Jobs ----

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServerResult<Json<ImportJob>> {
    state
        .cqrs
        .job(&id)?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("job {id}")))
}

pub async fn job_children_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServerResult<Json<Vec<ImportJob>>> {
    if state.cqrs.job(&id)?.is_none() {
        return Err(ServerError::NotFound(format!("job {id}")));
    }
    Ok(Json(state.cqrs.job_children(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<JobFailure>,
}

pub async fn update_job_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> ServerResult<Json<ImportJob>> {
    Ok(Json(
        state
            .cqrs
            .update_job_status(&id, update.status, update.error)
            .await?,
    ))
}

// ---- Export ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    pub sk_prefix: Option<String>,
    /// Comma-separated attribute columns.
    pub columns: Option<String>,
}

pub async fn export_handler(
    State(state): State<AppState>,
    Path(pk): Path<String>,
    Query(params): Query<ExportParams>,
) -> ServerResult<impl IntoResponse> {
    let query = PartitionQuery {
        sk_prefix: params.sk_prefix,
        ..PartitionQuery::default()
    };
    let columns = split_list(params.columns.as_deref());
    let csv = state.cqrs.export_csv(&pk, &query, &columns)?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}
