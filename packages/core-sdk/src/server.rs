use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{FromRequest, FromRequestParts, Path, Request, State},
    http::{request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    GenerateDescriptionRequest, GenerateDescriptionResponse, GenerateDiagramRequest,
    GenerateDiagramResponse, ImproveDiagramRequest, ImproveDiagramResponse, NewProvider,
    ProviderKind, ProviderRef, ProviderUpdate, SettingsView, TestProviderRequest,
    TestProviderResponse,
};
use crate::service::{AiProviderService, ErrorCategory, ServiceError};
use crate::telemetry;

/** \brief 上游身份层注入的用户标识头。 */
pub const USER_ID_HEADER: &str = "x-user-id";

type AppState = Arc<AiProviderService>;

/**
 * \brief 构建 `/api/v1/ai` 路由。
 * \param cors_origins 允许的跨域来源，空列表表示不添加 CORS 层
 */
pub fn router(service: AppState, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route("/settings", get(get_settings))
        .route("/settings/default-provider", put(set_default_provider))
        .route("/settings/auto-generate", put(set_auto_generate))
        .route("/providers", post(add_provider))
        .route("/providers/supported", get(supported_providers))
        .route(
            "/providers/{index}",
            put(update_provider_at).delete(remove_provider_at),
        )
        .route(
            "/providers/by-id/{id}",
            put(update_provider_by_id).delete(remove_provider_by_id),
        )
        .route("/generate-description", post(generate_description))
        .route("/generate-diagram", post(generate_diagram))
        .route("/improve-diagram", post(improve_diagram))
        .route("/test-provider", post(test_provider))
        .route("/health", get(health_check));

    let app = Router::new().nest("/api/v1/ai", api).with_state(service);
    if cors_origins.is_empty() {
        return app;
    }
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    app.layer(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8000"
 */
pub async fn run(addr: &str, service: AppState, cors_origins: &[String]) -> Result<()> {
    let app = router(service, cors_origins);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/** \brief 当前请求的用户 ID。 */
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| ServiceError::BadRequest(format!("missing {} header", USER_ID_HEADER)))
    }
}

/**
 * \brief JSON 请求体提取器；无法解析的请求体按 BadRequest 返回统一错误体。
 */
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ServiceError::BadRequest(rejection.body_text())),
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    status: u16,
    message: String,
}

fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCategory::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = status_for(self.category());
        let body = ErrorResponse {
            status: status.as_u16(),
            message: self.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize, Debug)]
struct DefaultProviderRequest {
    provider: ProviderKind,
}

#[derive(Deserialize, Debug)]
struct AutoGenerateRequest {
    auto_generate: bool,
}

#[derive(Serialize, Debug)]
struct SupportedProviders {
    providers: Vec<ProviderKind>,
}

/**
 * \brief 获取设置，缺失时创建。
 */
async fn get_settings(
    State(service): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<SettingsView>, ServiceError> {
    Ok(Json(service.get_settings(&user_id)?))
}

/**
 * \brief 新增 Provider（先校验 Key）。
 */
async fn add_provider(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<NewProvider>,
) -> Result<(StatusCode, Json<SettingsView>), ServiceError> {
    let view = service.add_provider(&user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn update_provider_at(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    Path(index): Path<usize>,
    ApiJson(payload): ApiJson<ProviderUpdate>,
) -> Result<Json<SettingsView>, ServiceError> {
    let view = service
        .update_provider(&user_id, ProviderRef::Index(index), payload)
        .await?;
    Ok(Json(view))
}

async fn update_provider_by_id(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
    ApiJson(payload): ApiJson<ProviderUpdate>,
) -> Result<Json<SettingsView>, ServiceError> {
    let view = service
        .update_provider(&user_id, ProviderRef::Id(id), payload)
        .await?;
    Ok(Json(view))
}

async fn remove_provider_at(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    Path(index): Path<usize>,
) -> Result<Json<SettingsView>, ServiceError> {
    Ok(Json(
        service.remove_provider(&user_id, ProviderRef::Index(index))?,
    ))
}

async fn remove_provider_by_id(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<Json<SettingsView>, ServiceError> {
    Ok(Json(service.remove_provider(&user_id, ProviderRef::Id(id))?))
}

async fn supported_providers(State(service): State<AppState>) -> Json<SupportedProviders> {
    Json(SupportedProviders {
        providers: service.supported_providers(),
    })
}

async fn set_default_provider(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<DefaultProviderRequest>,
) -> Result<Json<SettingsView>, ServiceError> {
    Ok(Json(
        service.set_default_provider(&user_id, payload.provider)?,
    ))
}

async fn set_auto_generate(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<AutoGenerateRequest>,
) -> Result<Json<SettingsView>, ServiceError> {
    Ok(Json(
        service.set_auto_generate(&user_id, payload.auto_generate)?,
    ))
}

async fn generate_description(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<GenerateDescriptionRequest>,
) -> Result<Json<GenerateDescriptionResponse>, ServiceError> {
    telemetry::log_event(
        "server.generate",
        &format!("description user={} type={}", user_id, payload.diagram_type),
    );
    Ok(Json(service.generate_description(&user_id, &payload).await?))
}

async fn generate_diagram(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<GenerateDiagramRequest>,
) -> Result<Json<GenerateDiagramResponse>, ServiceError> {
    telemetry::log_event(
        "server.generate",
        &format!("diagram user={} type={}", user_id, payload.diagram_type),
    );
    Ok(Json(service.generate_diagram(&user_id, &payload).await?))
}

async fn improve_diagram(
    State(service): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(payload): ApiJson<ImproveDiagramRequest>,
) -> Result<Json<ImproveDiagramResponse>, ServiceError> {
    telemetry::log_event(
        "server.generate",
        &format!("improve user={} type={}", user_id, payload.diagram_type),
    );
    Ok(Json(service.improve_diagram(&user_id, &payload).await?))
}

/**
 * \brief 测试 Key，不落库。
 */
async fn test_provider(
    State(service): State<AppState>,
    UserId(_user_id): UserId,
    ApiJson(payload): ApiJson<TestProviderRequest>,
) -> Result<Json<TestProviderResponse>, ServiceError> {
    Ok(Json(service.test_provider_report(&payload).await?))
}

async fn health_check(State(service): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "providers": service.supported_providers(),
    }))
}
