//! Maps [`KittError`] onto HTTP responses with a JSON `{error: …}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use kitt::KittError;

pub enum ApiError {
    Kitt(KittError),
    /// Credentials were present but don't authorize this request
    /// (CSRF mismatch on a browser-originated mutation).
    Forbidden(String),
}

impl From<KittError> for ApiError {
    fn from(e: KittError) -> Self {
        ApiError::Kitt(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            ApiError::Kitt(e) => match e {
                KittError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
                KittError::Auth(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
                KittError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
                KittError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
                KittError::Preflight { reason, detail } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    json!({ "error": detail, "reason": reason.as_str() }),
                ),
                KittError::Gone(msg) => (StatusCode::GONE, json!({ "error": msg })),
                KittError::Transient(msg) => {
                    (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg }))
                }
                KittError::Storage(e) => {
                    tracing::error!(error = %e, "storage failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "error": "storage failure" }),
                    )
                }
                KittError::Fatal(msg) => {
                    tracing::error!(error = %msg, "internal failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "error": "internal failure" }),
                    )
                }
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitt::PreflightReason;

    fn status_of(e: ApiError) -> StatusCode {
        e.into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_statuses() {
        use KittError::*;
        assert_eq!(
            status_of(ApiError::Kitt(Validation("x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Kitt(Auth("x".into()))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(ApiError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(ApiError::Kitt(NotFound("x".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::Kitt(Conflict("x".into()))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::Kitt(Preflight {
                reason: PreflightReason::UnsupportedArch,
                detail: "x".into()
            })),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(ApiError::Kitt(Gone("x".into()))), StatusCode::GONE);
    }
}
