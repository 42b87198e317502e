use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use mbc_command::CommandError;
use mbc_import::ImportError;
use mbc_sdk::SdkError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Sdk(#[from] SdkError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

fn command_status(e: &CommandError) -> StatusCode {
    match e {
        CommandError::VersionConflict { .. } => StatusCode::CONFLICT,
        CommandError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CommandError::NotFound(_) => StatusCode::NOT_FOUND,
        CommandError::SyncHandler { .. } => StatusCode::BAD_GATEWAY,
        CommandError::SyncTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn import_status(e: &ImportError) -> StatusCode {
    match e {
        ImportError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ImportError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ImportError::UnknownTable(_)
        | ImportError::InvalidRequest(_)
        | ImportError::Csv(_)
        | ImportError::Zip(_) => StatusCode::BAD_REQUEST,
        ImportError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ImportError::Command(inner) => command_status(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Sdk(SdkError::Command(e)) => command_status(e),
            Self::Sdk(SdkError::Import(e)) => import_status(e),
            Self::Sdk(SdkError::InvalidOperation(_)) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn command(&self) -> Option<&CommandError> {
        match self {
            Self::Sdk(SdkError::Command(e)) => Some(e),
            Self::Sdk(SdkError::Import(ImportError::Command(e))) => Some(e),
            _ => None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }

        let mut body = json!({ "error": self.to_string() });
        match self.command() {
            Some(CommandError::VersionConflict { current, .. }) => {
                body["currentVersion"] = json!(current);
            }
            Some(CommandError::SyncHandler { record, failures }) => {
                body["record"] = json!(record);
                body["failures"] = json!(failures);
            }
            Some(CommandError::SyncTimeout { record, .. }) => {
                body["record"] = json!(record);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}
