use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderName, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use depthcast_api_types::{CACHED_HEADER, JobConfig, TOOK_HEADER};

use crate::{
    application::{GatewayResponse, error::HttpError},
    domain::validate_job,
};

use super::HttpState;

const SOURCE: &str = "infra::http::render";

pub(super) async fn render_job(
    State(state): State<HttpState>,
    payload: Result<Json<JobConfig>, JsonRejection>,
) -> Response {
    let Json(job) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return HttpError::from_error(
                SOURCE,
                rejection.status(),
                rejection.body_text(),
                &rejection,
            )
            .into_response();
        }
    };

    if let Err(err) = validate_job(&job) {
        return HttpError::from(err).into_response();
    }

    gateway_response(state.gateway.submit(job).await)
}

fn gateway_response(response: GatewayResponse) -> Response {
    match response {
        GatewayResponse::Rendered {
            bytes,
            format,
            took,
            cached,
            ..
        } => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, format.content_type()),
                (
                    HeaderName::from_static(TOOK_HEADER),
                    format!("{:.2}", took.as_secs_f64()),
                ),
                (HeaderName::from_static(CACHED_HEADER), cached.to_string()),
            ],
            bytes,
        )
            .into_response(),
        GatewayResponse::Failed { key, message, .. } => HttpError::new(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            message.clone(),
            format!("render {} failed: {message}", key.short()),
        )
        .into_response(),
        GatewayResponse::TimedOut { key, took } => HttpError::new(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            "Request timed out",
            format!(
                "render {} still pending after {:.2}s",
                key.short(),
                took.as_secs_f64()
            ),
        )
        .into_response(),
        GatewayResponse::Rejected { error, .. } => HttpError::from(error).into_response(),
    }
}
