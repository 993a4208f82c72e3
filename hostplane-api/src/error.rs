use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hostplane_common::{ApiEnvelope, ApiErrorBody, OrchestratorError};
use tracing::error;

pub type ApiResult<T> = Result<Json<ApiEnvelope<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiEnvelope::ok(data)))
}

#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    /// Destructive operation called without `?confirm=true`.
    ConfirmationRequired(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Orchestrator(e)
    }
}

pub fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::AlreadyRunning(_)
        | OrchestratorError::NotRunning(_)
        | OrchestratorError::JobInProgress(_)
        | OrchestratorError::InvalidState(_) => StatusCode::CONFLICT,
        OrchestratorError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::UnsupportedDisplay(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::ProvisioningFailed(_)
        | OrchestratorError::LaunchFailed(_)
        | OrchestratorError::Store(_)
        | OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Orchestrator(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!(code = e.code(), "{}", e);
                }
                (status, Json(ApiEnvelope::<()>::err(&e))).into_response()
            }
            ApiError::ConfirmationRequired(what) => (
                StatusCode::BAD_REQUEST,
                Json(ApiEnvelope::<()> {
                    success: false,
                    data: None,
                    error: Some(ApiErrorBody {
                        code: "CONFIRMATION_REQUIRED".to_string(),
                        message: format!("{} requires ?confirm=true", what),
                    }),
                }),
            )
                .into_response(),
        }
    }
}
