#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use points_core::store::DefaultKv;
use points_core::{Error, NewRecord, PeopleService, RecordChanges, RecordId};
use crate::module::{Module, ModuleCtx};

#[derive(Clone)]
struct AppState {
    service: PeopleService<DefaultKv>,
    started: Instant,
}

#[derive(Serialize)]
struct Status {
    active_jobs: usize,
    locked_records: usize,
    uptime_ms: u64,
}

#[derive(Deserialize)]
struct CreateUser {
    name: String,
    surname: String,
    #[serde(alias = "birth")]
    birthday: NaiveDate,
    #[serde(default)]
    points: Option<u64>,
}

#[derive(Deserialize)]
struct UpdateUser {
    name: String,
    surname: String,
    #[serde(alias = "birth")]
    birthday: NaiveDate,
    points: u64,
}

/// Maps service failures and malformed bodies onto HTTP status codes.
enum ApiError {
    Service(Error),
    Body(JsonRejection),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self { Self::Service(e) }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self { Self::Body(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = match self {
            ApiError::Body(rejection) => {
                let body = json!({
                    "msg": "Request didn't contain obligatory parameters",
                    "detail": rejection.body_text(),
                });
                return (rejection.status(), Json(body)).into_response();
            }
            ApiError::Service(e) => e,
        };
        match e {
            Error::NotFound(id) => {
                (StatusCode::NOT_FOUND, Json(json!({"msg": "User not found", "id": id}))).into_response()
            }
            Error::Busy(id) => {
                (StatusCode::CONFLICT, Json(json!({"msg": "User not available, try later", "id": id}))).into_response()
            }
            e => {
                warn!("request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"msg": e.to_string()}))).into_response()
            }
        }
    }
}

pub struct WebServer {
    pub http_addr: SocketAddr,
}

impl WebServer {
    pub fn new(http_addr: SocketAddr) -> Self {
        Self { http_addr }
    }
}

pub fn router(service: PeopleService<DefaultKv>) -> Router {
    let state = AppState { service, started: Instant::now() };
    Router::new()
        .route("/status", get(status))
        .route("/rest_api/users", get(users_list).post(user_create))
        .route("/rest_api/users/:id", get(user_get).put(user_update).delete(user_delete))
        .with_state(state)
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(ctx.service.clone());
            let listener = tokio::net::TcpListener::bind(self.http_addr).await?;
            info!("web http listening on http://{}", self.http_addr);

            // clone into a mutable receiver to await .changed()
            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            Ok(())
        })
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    Json(Status {
        active_jobs: state.service.scheduler().active_jobs(),
        locked_records: state.service.locks().tracked(),
        uptime_ms,
    })
}

async fn users_list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let users = state.service.list()?;
    let msg = if users.is_empty() { "Users not found" } else { "Users found" };
    Ok(Json(json!({"msg": msg, "users": users})))
}

async fn user_get(Path(id): Path<RecordId>, State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let user = state.service.get(id)?;
    Ok(Json(json!({"msg": "User found", "user": user})))
}

async fn user_create(
    State(state): State<AppState>,
    body: Result<Json<CreateUser>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let new = NewRecord { name: body.name, surname: body.surname, birthday: body.birthday, points: body.points };
    let user = state.service.create(new).await?;
    Ok((StatusCode::CREATED, Json(json!({"msg": "New user added", "user": user}))))
}

async fn user_update(
    Path(id): Path<RecordId>,
    State(state): State<AppState>,
    body: Result<Json<UpdateUser>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let changes = RecordChanges { name: body.name, surname: body.surname, birthday: body.birthday, points: body.points };
    let user = state.service.update(id, changes).await?;
    Ok(Json(json!({"msg": "User updated", "user": user})))
}

async fn user_delete(Path(id): Path<RecordId>, State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.service.delete(id).await?;
    Ok(Json(json!({"msg": "User deleted", "id": id})))
}
