use axum::{
    extract::{OriginalUri, Query, State as AxumState},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use psicash_types::api::{TokensValid, TransactionBody, AUTH_HEADER, METADATA_HEADER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::{RequestRecord, Simulator, TransactionOutcome};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Deserialize)]
pub(super) struct TransactionQuery {
    class: Option<String>,
    distinguisher: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn delay(simulator: &Simulator) {
    let latency = simulator.latency();
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn http_metrics(AxumState(simulator): AxumState<Arc<Simulator>>) -> Response {
    Json(simulator.http_metrics().snapshot()).into_response()
}

pub(super) async fn transaction(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<TransactionQuery>,
    headers: HeaderMap,
) -> Response {
    delay(&simulator).await;
    let auth = header(&headers, AUTH_HEADER);
    let class = query.class.unwrap_or_default();
    let distinguisher = query.distinguisher.unwrap_or_default();

    let outcome = if simulator.take_failure() {
        TransactionOutcome::Unavailable
    } else {
        simulator.transaction(auth, &class, &distinguisher)
    };
    let status = outcome.status();
    simulator.with_state(|state| {
        state.record(RequestRecord {
            method: Method::POST.to_string(),
            path: uri.path().to_string(),
            class: Some(class.clone()),
            distinguisher: Some(distinguisher.clone()),
            tokens: auth.map(str::to_string),
            metadata: header(&headers, METADATA_HEADER)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
            status,
        })
    });
    tracing::debug!(class = %class, distinguisher = %distinguisher, status, "transaction");

    match outcome {
        TransactionOutcome::Rewarded {
            transaction_id,
            next_allowed,
        } => Json(TransactionBody::with_next_allowed(transaction_id, next_allowed)).into_response(),
        TransactionOutcome::CoolingDown { next_allowed } => {
            let mut body = TransactionBody::with_next_allowed("", next_allowed);
            body.transaction_id = None;
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        }
        TransactionOutcome::UnknownToken => StatusCode::UNAUTHORIZED.into_response(),
        TransactionOutcome::UnknownClass => StatusCode::BAD_REQUEST.into_response(),
        TransactionOutcome::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub(super) async fn validate_tokens(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    delay(&simulator).await;
    let auth = header(&headers, AUTH_HEADER);
    let failed = simulator.take_failure();

    let (status, body) = simulator.with_state(|state| {
        let body = auth.map(|auth| TokensValid {
            tokens_valid: auth
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(|token| (token.to_string(), state.token_valid(token)))
                .collect(),
        });
        let status = match (&body, failed) {
            (_, true) => StatusCode::SERVICE_UNAVAILABLE,
            (Some(body), false) if !body.tokens_valid.is_empty() => StatusCode::OK,
            _ => StatusCode::UNAUTHORIZED,
        };
        state.record(RequestRecord {
            method: Method::GET.to_string(),
            path: uri.path().to_string(),
            class: None,
            distinguisher: None,
            tokens: auth.map(str::to_string),
            metadata: None,
            status: status.as_u16(),
        });
        (status, body)
    });

    match (status, body) {
        (StatusCode::OK, Some(body)) => Json(body).into_response(),
        (status, _) => status.into_response(),
    }
}
