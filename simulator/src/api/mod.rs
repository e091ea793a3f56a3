use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use casebox_types::api::{paths, API_PREFIX};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Simulator;

mod http;

const HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    /// Full router, with the API nested under `/api/v1`.
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route(&route(paths::LOGIN), post(http::login))
            .route(&route(paths::REFRESH), post(http::refresh))
            .route(&route(paths::CURRENT_USER), get(http::current_user))
            .route(&route(paths::CASE_LIST), get(http::list_cases))
            .route(&route(paths::CASE_GET_ONE), get(http::get_case))
            .route(&route(paths::CASE_PRECHECK), get(http::precheck))
            .route(&route(paths::CASE_OPEN), post(http::open_case))
            .route(&route(paths::FAIRNESS_COMMIT), post(http::commit))
            .route(
                &format!("{}/:server_seed_id", route(paths::FAIRNESS_COMMIT)),
                delete(http::delete_commitment),
            )
            .route(
                &format!("{}/:spin_log_id", route(paths::FAIRNESS_REVEAL)),
                get(http::reveal),
            );

        Router::new()
            .route("/healthz", get(http::healthz))
            .nest(&format!("/{API_PREFIX}"), api)
            .layer(DefaultBodyLimit::max(HTTP_BODY_LIMIT_BYTES))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self.simulator.clone())
    }
}

fn route(path: &str) -> String {
    format!("/{path}")
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
