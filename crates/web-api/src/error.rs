use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{AuthError, ChatError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        ApiError::unauthorized(error.to_string())
    }
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        match error {
            ChatError::Unauthenticated(err) => err.into(),
            ChatError::RateLimited => ApiError::too_many_requests("rate limited"),
            other => ApiError::internal_server_error(other.to_string()),
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::Chat(err) => err.into(),
            ApplicationError::Storage(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                format!("storage error: {}", err),
            ),
            ApplicationError::Infrastructure { message, .. } => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INFRASTRUCTURE_ERROR",
                message,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_status() {
        let err: ApiError = ChatError::Unauthenticated(AuthError::Expired).into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let err: ApiError = ApplicationError::from(ChatError::RateLimited).into();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err: ApiError = ApplicationError::infrastructure("redis down").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
