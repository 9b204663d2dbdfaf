use axum::{
    extract::{Request, State as AxumState},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use psicash_types::api::{TRANSACTION_PATH, VALIDATE_TOKENS_PATH};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{Simulator, API_PREFIX};

mod http;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        // The widget calls the API from its own origin, so browsers need CORS
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS");
        let cors = if allowed_origins.is_empty() || allowed_origins.contains("*") {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            let origins = allowed_origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "invalid origin in ALLOWED_HTTP_ORIGINS");
                        None
                    }
                })
                .collect::<Vec<_>>();
            CorsLayer::new().allow_origin(AllowOrigin::list(origins))
        }
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static("x-psicash-auth"),
            HeaderName::from_static("x-psicash-metadata"),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)]);

        let api = Router::new()
            .route(TRANSACTION_PATH, post(http::transaction))
            .route(VALIDATE_TOKENS_PATH, get(http::validate_tokens))
            .route("/metrics/http", get(http::http_metrics))
            .layer(middleware::from_fn_with_state(
                self.simulator.clone(),
                request_id_middleware,
            ));

        Router::new()
            .route("/healthz", get(http::healthz))
            .nest(API_PREFIX, api)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.simulator.clone())
    }
}

fn parse_allowed_origins(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

async fn request_id_middleware(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    let status = response.status().as_u16();
    simulator.http_metrics().record(status, start.elapsed());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "http.request"
    );
    response
}
