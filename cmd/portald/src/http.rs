//! HTTP surface. Authentication itself lives in the gateway in front of the
//! portal; this layer only translates trusted gateway headers into an
//! [`Actor`] and maps domain errors onto status codes.

use portal_build::context::BuildContext;
use portal_build::keys;
use portal_build::orchestrator;
use portal_build::webhook::{self, EVENT_HEADER, SIGNATURE_HEADER};
use portal_operator::actor::{self, Actor};
use portal_operator::context::Context;
use portal_operator::deploy;
use portal_operator::error::Error;
use portal_operator::status;
use portal_store::model::{BuildStatus, ProjectClass, Student};
use portal_store::repo;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Context,
    pub build: BuildContext,
}

pub fn router(ctx: Context, build: BuildContext) -> Router {
    let state = AppState { ctx, build };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/api/v1/deploy/{student_code}",
            post(trigger_deploy).delete(remove_deploy),
        )
        .route("/api/v1/status", get(all_statuses))
        .route("/api/v1/status/{student_code}", get(student_status))
        .route("/api/v1/monitoring/selector", get(selector_status))
        .route(
            "/api/v1/students/{student_id}/deploy-key",
            post(generate_deploy_key),
        )
        .route("/api/v1/builds/trigger/{student_id}", post(trigger_build))
        .route("/api/v1/builds/{build_id}", get(get_build))
        .route("/api/v1/builds/{build_id}/logs", get(get_build_logs))
        .route("/api/v1/webhooks/git", post(git_webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.ctx.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(msg = "failed to encode metrics", %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) | Error::SerializationError(..) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::StateConflict(_) => StatusCode::CONFLICT,
            Error::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ClusterError(..) | Error::DatabaseError(..) | Error::ObjectStore(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, Error> {
    if headers.contains_key("x-portal-deploy-token") {
        return Ok(Actor::DeployToken);
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    match header("x-portal-role").as_str() {
        "admin" => Ok(Actor::Admin),
        "teacher" => {
            let id = header("x-portal-actor-id")
                .parse()
                .map_err(|_| Error::Forbidden("malformed actor id".to_string()))?;
            Ok(Actor::Teacher { id })
        }
        "student" => {
            let id = header("x-portal-actor-id")
                .parse()
                .map_err(|_| Error::Forbidden("malformed actor id".to_string()))?;
            Ok(Actor::Student {
                id,
                code: header("x-portal-student-code"),
            })
        }
        _ => Err(Error::Forbidden("unauthenticated request".to_string())),
    }
}

async fn load_student(ctx: &Context, student_code: &str) -> Result<Student, Error> {
    repo::student_by_code(&ctx.db, student_code)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {student_code}")))
}

#[derive(Deserialize)]
struct DeployRequest {
    image: String,
    class: ProjectClass,
    build_id: Option<i64>,
}

async fn trigger_deploy(
    State(state): State<AppState>,
    Path(student_code): Path<String>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> Result<Json<deploy::DeployOutcome>, AppError> {
    let actor = actor_from_headers(&headers)?;
    let student = load_student(&state.ctx, &student_code).await?;
    if let Some(build_id) = request.build_id {
        let build = repo::build_by_id(&state.ctx.db, build_id)
            .await
            .map_err(|e| Error::db("failed to load build", e))?
            .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
        if build.status != BuildStatus::Success {
            return Err(Error::StateConflict(format!(
                "build {build_id} is {}, only successful builds can be deployed",
                build.status
            ))
            .into());
        }
    }
    let outcome = deploy::deploy(
        &state.ctx,
        &actor,
        &student,
        &request.image,
        request.class,
        request.build_id,
    )
    .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct ClassQuery {
    class: ProjectClass,
}

async fn remove_deploy(
    State(state): State<AppState>,
    Path(student_code): Path<String>,
    Query(query): Query<ClassQuery>,
    headers: HeaderMap,
) -> Result<Json<deploy::DeleteOutcome>, AppError> {
    let actor = actor_from_headers(&headers)?;
    let student = load_student(&state.ctx, &student_code).await?;
    let outcome = deploy::delete(&state.ctx, &actor, &student, query.class).await?;
    Ok(Json(outcome))
}

async fn student_status(
    State(state): State<AppState>,
    Path(student_code): Path<String>,
    Query(query): Query<ClassQuery>,
    headers: HeaderMap,
) -> Result<Json<status::WorkloadStatus>, AppError> {
    let actor = actor_from_headers(&headers)?;
    let student = load_student(&state.ctx, &student_code).await?;
    actor::ensure_can_view(&actor, &student)?;
    let result = status::student_status(&state.ctx, &student_code, query.class).await?;
    Ok(Json(result))
}

async fn all_statuses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = actor_from_headers(&headers)?;
    if !actor.can_list_all() {
        return Err(Error::Forbidden("listing requires teacher or admin".to_string()).into());
    }
    let statuses = status::all_statuses(&state.ctx).await?;
    Ok(Json(statuses).into_response())
}

#[derive(Deserialize)]
struct SelectorQuery {
    namespace: String,
    #[serde(default)]
    selector: String,
}

async fn selector_status(
    State(state): State<AppState>,
    Query(query): Query<SelectorQuery>,
    headers: HeaderMap,
) -> Result<Json<status::WorkloadStatus>, AppError> {
    let actor = actor_from_headers(&headers)?;
    if !actor.can_list_all() {
        return Err(Error::Forbidden("monitoring requires teacher or admin".to_string()).into());
    }
    let result = status::status_by_selector(&state.ctx, &query.namespace, &query.selector).await?;
    Ok(Json(result))
}

#[derive(Deserialize, Default)]
struct DeployKeyRequest {
    #[serde(default)]
    force: bool,
}

/// Lazily issues the deploy key: an existing pair is returned unchanged
/// unless `force` is set, and forcing a rotation needs teacher or admin
/// privilege.
async fn generate_deploy_key(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<DeployKeyRequest>>,
) -> Result<Response, AppError> {
    let actor = actor_from_headers(&headers)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let student = repo::student_by_id(&state.ctx.db, student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
    actor::ensure_can_generate_deploy_key(&actor, &student, request.force)?;
    let config = repo::build_config_for_student(&state.ctx.db, student_id)
        .await
        .map_err(|e| Error::db("failed to load build config", e))?
        .ok_or_else(|| Error::NotFound(format!("build config for student {student_id}")))?;

    if let Some(public_key) = config.deploy_key_public.as_deref().filter(|k| !k.is_empty()) {
        if !request.force {
            return Ok(Json(json!({
                "public_key": public_key,
                "fingerprint": config.deploy_key_fingerprint,
            }))
            .into_response());
        }
    }

    let pair = keys::generate_deploy_key_pair(keys::DEPLOY_KEY_BITS)?;
    repo::save_deploy_key(
        &state.ctx.db,
        student_id,
        &pair.public_key,
        &pair.private_key,
        &pair.fingerprint,
        Utc::now(),
    )
    .await
    .map_err(|e| Error::db("failed to save deploy key", e))?;

    // The private half never leaves the store; register the public half
    // with the git host.
    Ok(Json(json!({
        "public_key": pair.public_key,
        "fingerprint": pair.fingerprint,
    }))
    .into_response())
}

#[derive(Deserialize, Default)]
struct TriggerBuildRequest {
    commit_sha: Option<String>,
    branch: Option<String>,
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<TriggerBuildRequest>,
) -> Result<Response, AppError> {
    let actor = actor_from_headers(&headers)?;
    let student = repo::student_by_id(&state.ctx.db, student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?;
    actor::ensure_can_view(&actor, &student)?;
    let build = orchestrator::trigger(
        &state.build,
        student_id,
        request.commit_sha.as_deref().unwrap_or("latest"),
        request.branch.as_deref(),
    )
    .await?;
    Ok(Json(build).into_response())
}

async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = actor_from_headers(&headers)?;
    let build = repo::build_by_id(&state.ctx.db, build_id)
        .await
        .map_err(|e| Error::db("failed to load build", e))?
        .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
    let student = repo::student_by_id(&state.ctx.db, build.student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {}", build.student_id)))?;
    actor::ensure_can_view(&actor, &student)?;
    let build = orchestrator::sync(&state.build, build).await?;
    Ok(Json(build).into_response())
}

async fn get_build_logs(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = actor_from_headers(&headers)?;
    let build = repo::build_by_id(&state.ctx.db, build_id)
        .await
        .map_err(|e| Error::db("failed to load build", e))?
        .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
    let student = repo::student_by_id(&state.ctx.db, build.student_id)
        .await
        .map_err(|e| Error::db("failed to load student", e))?
        .ok_or_else(|| Error::NotFound(format!("student {}", build.student_id)))?;
    actor::ensure_can_view(&actor, &student)?;

    let Some(store) = state.build.logs.as_ref() else {
        return Err(Error::DependencyUnavailable("object store is disabled".to_string()).into());
    };
    let Some(object_key) = build.log_object_key.as_deref() else {
        return Err(Error::NotFound(format!("logs for build {build_id}")).into());
    };
    let content = store.fetch_log(object_key).await?;
    Ok(([("content-type", "text/plain; charset=utf-8")], content).into_response())
}

async fn git_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<webhook::PushOutcome>, AppError> {
    let event_type = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = webhook::on_push(&state.build, event_type, signature, &body).await?;
    Ok(Json(outcome))
}
