// ==========================================
// 生产批次追溯引擎 - HTTP 接口
// ==========================================
// 职责: 路由、请求头解析、同步引擎调用下放到阻塞线程池
// 身份: 外部认证层写入 X-User-Id / X-User-Role
// ==========================================

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value as JsonValue};
use tower_http::trace::TraceLayer;

use crate::api::{
    AdvanceBody, ApiError, ApiResult, Caller, CreateRunBody, LinkBody, PlaceLotBody, ReasonBody,
    ResolutionBody, Role, TransferBody,
};
use crate::app::state::AppState;
use crate::domain::lot::LotRegistration;
use crate::domain::qc::NewQcDecision;
use crate::domain::temperature::{NewTemperatureLog, TemperatureLogFilter};
use crate::engine::EngineError;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";

/// 构建路由
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // 生产运行
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/steps", get(run_steps))
        .route("/runs/:id/buffers", get(run_buffers))
        .route("/runs/:id/events", get(run_events))
        .route("/runs/:id/start", post(start_run))
        .route("/runs/:id/advance", post(advance_run))
        .route("/runs/:id/hold", post(hold_run))
        .route("/runs/:id/resume", post(resume_run))
        .route("/runs/:id/complete", post(complete_run))
        .route("/runs/:id/abort", post(abort_run))
        .route("/runs/:id/archive", post(archive_run))
        // 质检
        .route("/qc-decisions", post(record_qc_decision))
        .route("/qc-gates", get(list_qc_gates))
        // 谱系
        .route("/genealogy/links", post(link_lots))
        .route("/genealogy/:lot_id/parents", get(genealogy_parents))
        .route("/genealogy/:lot_id/children", get(genealogy_children))
        .route("/genealogy/:lot_id/tree", get(genealogy_tree))
        .route("/traceability/:lot_code", get(traceability))
        // 批次
        .route("/lots", post(register_lot).get(list_lots))
        .route("/lots/:id", get(get_lot))
        // 缓冲区
        .route("/buffers", get(list_buffers))
        .route("/buffers/transfer", post(transfer_lot))
        .route("/buffers/:id/inventory", get(buffer_inventory))
        .route("/buffers/:id/lots", post(place_lot))
        .route("/buffers/:id/lots/:lot_id", delete(remove_lot))
        // 温度记录
        .route("/temperature-logs", post(record_temperature).get(list_temperature_logs))
        .route("/temperature-logs/:id", get(get_temperature_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 绑定地址并启动服务
pub async fn serve(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("HTTP 服务已监听: {}", bind_addr);
    axum::serve(listener, create_router(state)).await
}

// ==========================================
// 请求辅助
// ==========================================

/// 从请求头解析调用方
pub fn caller_from_headers(headers: &HeaderMap) -> ApiResult<Caller> {
    let user_id = header_str(headers, HEADER_USER_ID)
        .ok_or_else(|| ApiError::Forbidden("缺少 X-User-Id 请求头".to_string()))?;
    let raw_role = header_str(headers, HEADER_USER_ROLE)
        .ok_or_else(|| ApiError::Forbidden("缺少 X-User-Role 请求头".to_string()))?;
    let role = Role::parse(raw_role)
        .ok_or_else(|| ApiError::Forbidden(format!("未知角色: {}", raw_role)))?;
    Ok(Caller::new(user_id, role))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// 在阻塞线程池执行同步引擎调用
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        ApiError::Engine(EngineError::Storage(format!("后台任务执行失败: {}", e)))
    })?
}

/// JSON 请求体,解析失败返回 INVALID_INPUT 结构化错误
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct JsonBody<T>(T);

/// 查询参数,解析失败同样返回 INVALID_INPUT
#[derive(Debug, FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct QueryParams<T>(T);

/// 可省略的 JSON 请求体: 空请求体取默认值,非空则必须是合法 JSON
#[derive(Debug)]
struct OptionalJsonBody<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for OptionalJsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::InvalidInput(format!("请求体读取失败: {}", e.body_text())))?;
        parse_optional_body(&bytes).map(OptionalJsonBody)
    }
}

fn parse_optional_body<T: DeserializeOwned + Default>(bytes: &[u8]) -> ApiResult<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::InvalidInput(format!("请求体 JSON 无效: {}", e)))
}

#[derive(Debug, Default, Deserialize)]
struct RunListQuery {
    status_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DepthQuery {
    depth: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

// ==========================================
// 系统
// ==========================================

async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

// ==========================================
// 生产运行
// ==========================================

async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    OptionalJsonBody(body): OptionalJsonBody<CreateRunBody>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let key = header_str(&headers, HEADER_IDEMPOTENCY_KEY).map(str::to_string);
    let api = state.run_api.clone();

    let outcome = blocking(move || api.create(&caller, key.as_deref(), body)).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!(outcome.run))))
}

async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    QueryParams(q): QueryParams<RunListQuery>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let runs = blocking(move || api.list(&caller, q.status_filter.as_deref())).await?;
    Ok(Json(json!(runs)))
}

async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.get(&caller, &id)).await?;
    Ok(Json(json!(run)))
}

async fn run_steps(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let steps = blocking(move || api.steps(&caller, &id)).await?;
    Ok(Json(json!(steps)))
}

async fn run_buffers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let buffers = blocking(move || api.buffers(&caller, &id)).await?;
    Ok(Json(json!(buffers)))
}

async fn run_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let events = blocking(move || api.events(&caller, &id)).await?;
    Ok(Json(json!(events)))
}

async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.start(&caller, &id)).await?;
    Ok(Json(json!(run)))
}

async fn advance_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    OptionalJsonBody(body): OptionalJsonBody<AdvanceBody>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let outcome = blocking(move || api.advance(&caller, &id, body)).await?;
    Ok(Json(json!(outcome)))
}

async fn hold_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    OptionalJsonBody(body): OptionalJsonBody<ReasonBody>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.hold(&caller, &id, body)).await?;
    Ok(Json(json!(run)))
}

async fn resume_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    OptionalJsonBody(body): OptionalJsonBody<ResolutionBody>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.resume(&caller, &id, body)).await?;
    Ok(Json(json!(run)))
}

async fn complete_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.complete(&caller, &id)).await?;
    Ok(Json(json!(run)))
}

async fn abort_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    OptionalJsonBody(body): OptionalJsonBody<ReasonBody>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.abort(&caller, &id, body)).await?;
    Ok(Json(json!(run)))
}

async fn archive_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.run_api.clone();
    let run = blocking(move || api.archive(&caller, &id)).await?;
    Ok(Json(json!(run)))
}

// ==========================================
// 质检
// ==========================================

async fn record_qc_decision(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(input): JsonBody<NewQcDecision>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let api = state.qc_api.clone();
    let decision = blocking(move || api.record_decision(&caller, input)).await?;
    Ok((StatusCode::CREATED, Json(json!(decision))))
}

async fn list_qc_gates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.qc_api.clone();
    let gates = blocking(move || api.list_gates(&caller)).await?;
    Ok(Json(json!(gates)))
}

// ==========================================
// 谱系
// ==========================================

async fn genealogy_parents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lot_id): Path<String>,
    QueryParams(q): QueryParams<DepthQuery>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.genealogy_api.clone();
    let graph = blocking(move || api.parents(&caller, &lot_id, q.depth)).await?;
    Ok(Json(json!(graph)))
}

async fn genealogy_children(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lot_id): Path<String>,
    QueryParams(q): QueryParams<DepthQuery>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.genealogy_api.clone();
    let graph = blocking(move || api.children(&caller, &lot_id, q.depth)).await?;
    Ok(Json(json!(graph)))
}

async fn genealogy_tree(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lot_id): Path<String>,
    QueryParams(q): QueryParams<DepthQuery>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.genealogy_api.clone();
    let graph = blocking(move || api.tree(&caller, &lot_id, q.depth)).await?;
    Ok(Json(json!(graph)))
}

async fn traceability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lot_code): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.genealogy_api.clone();
    let view = blocking(move || api.trace_by_code(&caller, &lot_code)).await?;
    Ok(Json(json!(view)))
}

async fn link_lots(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<LinkBody>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let api = state.lot_api.clone();
    let link = blocking(move || api.link(&caller, body)).await?;
    Ok((StatusCode::CREATED, Json(json!(link))))
}

// ==========================================
// 批次
// ==========================================

async fn register_lot(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(input): JsonBody<LotRegistration>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let api = state.lot_api.clone();
    let registered = blocking(move || api.register(&caller, input)).await?;
    Ok((StatusCode::CREATED, Json(json!(registered))))
}

async fn list_lots(
    State(state): State<AppState>,
    headers: HeaderMap,
    QueryParams(q): QueryParams<LimitQuery>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.lot_api.clone();
    let lots = blocking(move || api.list(&caller, q.limit)).await?;
    Ok(Json(json!(lots)))
}

async fn get_lot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.lot_api.clone();
    let lot = blocking(move || api.get(&caller, &id)).await?;
    Ok(Json(json!(lot)))
}

// ==========================================
// 缓冲区
// ==========================================

async fn list_buffers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.buffer_api.clone();
    let buffers = blocking(move || api.list(&caller)).await?;
    Ok(Json(json!(buffers)))
}

async fn buffer_inventory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.buffer_api.clone();
    let inventory = blocking(move || api.inventory(&caller, &id)).await?;
    Ok(Json(json!(inventory)))
}

async fn place_lot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<PlaceLotBody>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let api = state.buffer_api.clone();
    let entry = blocking(move || api.place_lot(&caller, &id, body)).await?;
    Ok((StatusCode::CREATED, Json(json!(entry))))
}

async fn remove_lot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, lot_id)): Path<(String, String)>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.buffer_api.clone();
    let outcome = blocking(move || api.remove_lot(&caller, &id, &lot_id)).await?;
    Ok(Json(json!(outcome)))
}

async fn transfer_lot(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<TransferBody>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.buffer_api.clone();
    let outcome = blocking(move || api.transfer(&caller, body)).await?;
    Ok(Json(json!(outcome)))
}

// ==========================================
// 温度记录
// ==========================================

async fn record_temperature(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(input): JsonBody<NewTemperatureLog>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let caller = caller_from_headers(&headers)?;
    let api = state.temperature_api.clone();
    let log = blocking(move || api.record(&caller, input)).await?;
    Ok((StatusCode::CREATED, Json(json!(log))))
}

async fn list_temperature_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    QueryParams(filter): QueryParams<TemperatureLogFilter>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.temperature_api.clone();
    let logs = blocking(move || api.list(&caller, filter)).await?;
    Ok(Json(json!(logs)))
}

async fn get_temperature_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let caller = caller_from_headers(&headers)?;
    let api = state.temperature_api.clone();
    let log = blocking(move || api.get(&caller, &id)).await?;
    Ok(Json(json!(log)))
}
