//! HTTP mapping for engine errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use uuid::Uuid;

use ivy_core::error::CoreError;

/// An error ready to be rendered as a JSON response.
pub struct ApiError {
    status: StatusCode,
    message: String,
    correlation_id: Option<Uuid>,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
            correlation_id: None,
        }
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: msg.into(),
            correlation_id: None,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Unprocessable(_) | CoreError::InvalidTransition { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::ToolUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Infrastructure failures get a correlation id so the log line and
        // the user report can be matched up.
        let correlation_id = if status == StatusCode::INTERNAL_SERVER_ERROR {
            let id = Uuid::new_v4();
            tracing::error!(correlation_id = %id, error = %err, "internal error");
            Some(id)
        } else {
            None
        };

        Self {
            status,
            message: err.to_string(),
            correlation_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = match self.correlation_id {
            Some(id) => serde_json::json!({
                "error": self.message,
                "correlation_id": id,
            }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::conflict("x"), StatusCode::CONFLICT),
            (CoreError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (
                CoreError::InvalidRequest("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CoreError::unprocessable("x"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                CoreError::invalid_transition("a", "b"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                CoreError::ToolUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                CoreError::UpstreamFailure("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, expected);
            assert!(api.correlation_id.is_none());
        }
    }

    #[test]
    fn internal_errors_get_correlation_ids() {
        let api: ApiError = CoreError::Internal(anyhow::anyhow!("boom")).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(api.correlation_id.is_some());
    }
}
