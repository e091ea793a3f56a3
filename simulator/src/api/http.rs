use axum::{
    extract::{Path, Query, State as AxumState},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use casebox_types::{
    api::{ErrorBody, LoginRequest, RefreshRequest},
    Admission, CaseDefinition, Commitment, OpenRequest, Reveal, SpinResult, TokenPair, UserProfile,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{SimError, Simulator};

impl IntoResponse for SimError {
    fn into_response(self) -> Response {
        let status = match &self {
            SimError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SimError::Forbidden(_) => StatusCode::FORBIDDEN,
            SimError::NotFound(_) => StatusCode::NOT_FOUND,
            SimError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SimError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            SimError::Conflict(_) => StatusCode::CONFLICT,
            SimError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            SimError::Draw(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Deserialize)]
pub(super) struct CaseQuery {
    case_id: String,
}

type Shared = AxumState<Arc<Simulator>>;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn user(simulator: &Simulator, headers: &HeaderMap) -> Result<u64, SimError> {
    simulator.authenticate(bearer(headers)).await
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn login(
    AxumState(simulator): Shared,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenPair>, SimError> {
    simulator.login(&body.init_data).await.map(Json)
}

pub(super) async fn refresh(
    AxumState(simulator): Shared,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, SimError> {
    simulator.refresh(&body.refresh_token).await.map(Json)
}

pub(super) async fn current_user(
    AxumState(simulator): Shared,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.current_user(user).await.map(Json)
}

pub(super) async fn list_cases(
    AxumState(simulator): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<CaseDefinition>>, SimError> {
    let user = user(&simulator, &headers).await?;
    Ok(Json(simulator.list_cases(user).await))
}

pub(super) async fn get_case(
    AxumState(simulator): Shared,
    headers: HeaderMap,
    Query(query): Query<CaseQuery>,
) -> Result<Json<CaseDefinition>, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.case(user, &query.case_id).await.map(Json)
}

pub(super) async fn precheck(
    AxumState(simulator): Shared,
    headers: HeaderMap,
    Query(query): Query<CaseQuery>,
) -> Result<Json<Admission>, SimError> {
    user(&simulator, &headers).await?;
    simulator.precheck(&query.case_id).await.map(Json)
}

pub(super) async fn open_case(
    AxumState(simulator): Shared,
    headers: HeaderMap,
    Json(body): Json<OpenRequest>,
) -> Result<Json<SpinResult>, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.open(user, &body).await.map(Json)
}

pub(super) async fn commit(
    AxumState(simulator): Shared,
    headers: HeaderMap,
) -> Result<Json<Commitment>, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.commit(user).await.map(Json)
}

pub(super) async fn delete_commitment(
    AxumState(simulator): Shared,
    headers: HeaderMap,
    Path(server_seed_id): Path<String>,
) -> Result<StatusCode, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.delete_commitment(user, &server_seed_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn reveal(
    AxumState(simulator): Shared,
    headers: HeaderMap,
    Path(spin_log_id): Path<String>,
) -> Result<Json<Reveal>, SimError> {
    let user = user(&simulator, &headers).await?;
    simulator.reveal(user, &spin_log_id).await.map(Json)
}
