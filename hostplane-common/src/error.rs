use serde::{Deserialize, Serialize};

/// Failures surfaced at the orchestrator boundary.
///
/// Every variant maps to a stable code (see [`OrchestratorError::code`]) that the
/// API layer turns into an HTTP status. None of these are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("VM {0} is already running")]
    AlreadyRunning(String),

    #[error("VM {0} is not running")]
    NotRunning(String),

    #[error("no free display port in range {min}-{max}")]
    ResourceExhausted { min: u16, max: u16 },

    #[error("disk provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("hypervisor launch failed: {0}")]
    LaunchFailed(String),

    #[error("a backup or restore job is already in progress for VM {0}")]
    JobInProgress(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("VM {0} does not use the SPICE display protocol")]
    UnsupportedDisplay(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "NOT_FOUND",
            OrchestratorError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            OrchestratorError::AlreadyRunning(_) => "ALREADY_RUNNING",
            OrchestratorError::NotRunning(_) => "NOT_RUNNING",
            OrchestratorError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            OrchestratorError::ProvisioningFailed(_) => "PROVISIONING_FAILED",
            OrchestratorError::LaunchFailed(_) => "LAUNCH_FAILED",
            OrchestratorError::JobInProgress(_) => "JOB_IN_PROGRESS",
            OrchestratorError::InvalidState(_) => "INVALID_STATE",
            OrchestratorError::UnsupportedDisplay(_) => "UNSUPPORTED_DISPLAY",
            OrchestratorError::Store(_) | OrchestratorError::Io(_) => "INTERNAL_ERROR",
        }
    }

    pub fn vm_not_found(id: impl std::fmt::Display) -> Self {
        OrchestratorError::NotFound(format!("VM {}", id))
    }

    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        OrchestratorError::NotFound(format!("backup job {}", id))
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        OrchestratorError::Store(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// `{ "success": bool, "data"?: T, "error"?: { code, message } }`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(e: &OrchestratorError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }
}
