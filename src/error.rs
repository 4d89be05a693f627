// src/error.rs

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Body returned by the download endpoint when an archive is missing.
pub const ARCHIVE_NOT_FOUND_BODY: &str = "ZIP archive not found.";

#[derive(Error, Debug)]
pub enum RelayError {
    /// Wrong passphrase or malformed key, detected through the keygen exit code.
    #[error("Failed to decrypt SSH key. Is the passphrase correct?")]
    Decryption { exit_code: Option<i32> },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No target addresses were supplied")]
    EmptyTargetList,

    #[error("ZIP archive not found.")]
    ArchiveNotFound,

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            // Reported in-band, the same way streamed output is.
            Self::Decryption { .. } => StatusCode::OK,
            Self::EmptyTargetList | Self::InvalidField { .. } => StatusCode::BAD_REQUEST,
            Self::ArchiveNotFound => StatusCode::NOT_FOUND,
            Self::Launch { .. } | Self::Io { .. } | Self::Archive(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The plain-text line the client sees for this error.
    pub fn client_line(&self) -> String {
        match self {
            Self::ArchiveNotFound => ARCHIVE_NOT_FOUND_BODY.to_string(),
            other => format!("ERROR: {}\n", other),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.client_line(),
        )
            .into_response()
    }
}
