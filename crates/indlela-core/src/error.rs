//! Error types for the indlela runtime.
//!
//! Every failure maps to a stable [`ErrorCode`] with a fixed retriability,
//! and carries structured [`ErrorDetails`] filled from the failing context.
//! The wire form ([`WireError`]) is what progress streams and task events
//! embed; [`Error`] is the richer in-process type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of stable error identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "MODEL_NOT_FOUND")]
    ModelNotFound,
    #[serde(rename = "MODEL_VERIFY_FAILED")]
    ModelVerifyFailed,
    #[serde(rename = "RUNTIME_NOT_AVAILABLE")]
    RuntimeNotAvailable,
    #[serde(rename = "UNSUPPORTED_PLATFORM")]
    UnsupportedPlatform,
    #[serde(rename = "INSUFFICIENT_MEMORY")]
    InsufficientMemory,
    #[serde(rename = "TASK_TIMEOUT")]
    TaskTimeout,
    #[serde(rename = "TASK_CANCELLED")]
    TaskCancelled,
    #[serde(rename = "DOWNLOAD_FAILED")]
    DownloadFailed,
    #[serde(rename = "INVALID_MODEL_FORMAT")]
    InvalidModelFormat,
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError,
}

impl ErrorCode {
    /// Stable wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::ModelVerifyFailed => "MODEL_VERIFY_FAILED",
            Self::RuntimeNotAvailable => "RUNTIME_NOT_AVAILABLE",
            Self::UnsupportedPlatform => "UNSUPPORTED_PLATFORM",
            Self::InsufficientMemory => "INSUFFICIENT_MEMORY",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::TaskCancelled => "TASK_CANCELLED",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::InvalidModelFormat => "INVALID_MODEL_FORMAT",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Whether a retry of the failed operation may succeed.
    pub fn retriable(&self) -> bool {
        match self {
            Self::ModelNotFound
            | Self::UnsupportedPlatform
            | Self::InvalidModelFormat
            | Self::ConfigError => false,
            Self::ModelVerifyFailed
            | Self::RuntimeNotAvailable
            | Self::InsufficientMemory
            | Self::TaskTimeout
            | Self::TaskCancelled
            | Self::DownloadFailed => true,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured diagnostic context attached to an error.
///
/// Unknown keys survive round trips through the `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        self.backend.is_none()
            && self.artifact.is_none()
            && self.expected_sha256.is_none()
            && self.actual_sha256.is_none()
            && self.required_bytes.is_none()
            && self.available_bytes.is_none()
            && self.extra.is_empty()
    }
}

/// Serializable error as it appears on progress streams and task events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("artifact {artifact} failed verification")]
    VerifyFailed {
        artifact: String,
        expected_sha256: String,
        actual_sha256: String,
    },

    #[error("no runtime available: {message}")]
    RuntimeNotAvailable {
        message: String,
        details: Box<ErrorDetails>,
    },

    #[error("unsupported platform: {message}")]
    UnsupportedPlatform { message: String },

    #[error("insufficient memory: {required_bytes} bytes required, {available_bytes} available")]
    InsufficientMemory {
        required_bytes: u64,
        available_bytes: u64,
    },

    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("task cancelled")]
    TaskCancelled,

    #[error("download failed: {message}")]
    DownloadFailed {
        message: String,
        details: Box<ErrorDetails>,
    },

    #[error("invalid manifest: {0}")]
    InvalidModelFormat(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl Error {
    /// Stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ModelNotFound(_) => ErrorCode::ModelNotFound,
            Self::VerifyFailed { .. } => ErrorCode::ModelVerifyFailed,
            Self::RuntimeNotAvailable { .. } => ErrorCode::RuntimeNotAvailable,
            Self::UnsupportedPlatform { .. } => ErrorCode::UnsupportedPlatform,
            Self::InsufficientMemory { .. } => ErrorCode::InsufficientMemory,
            Self::TaskTimeout(_) => ErrorCode::TaskTimeout,
            Self::TaskCancelled => ErrorCode::TaskCancelled,
            Self::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            Self::InvalidModelFormat(_) => ErrorCode::InvalidModelFormat,
            Self::ConfigError(_) => ErrorCode::ConfigError,
        }
    }

    pub fn retriable(&self) -> bool {
        self.code().retriable()
    }

    /// Build a download failure from a transport message.
    pub fn download(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
            details: Box::new(ErrorDetails::default()),
        }
    }

    /// Build a download failure from an I/O error, flagging disk-full.
    pub fn download_io(err: std::io::Error) -> Self {
        let mut details = ErrorDetails::default();
        // ENOSPC surfaces as a structured cause so callers can special-case it.
        if err.raw_os_error() == Some(28) {
            details
                .extra
                .insert("cause".into(), Value::String("DISK_FULL".into()));
        }
        if let Some(os) = err.raw_os_error() {
            details.extra.insert("osError".into(), Value::from(os));
        }
        Self::DownloadFailed {
            message: err.to_string(),
            details: Box::new(details),
        }
    }

    /// Structured diagnostic context for this error.
    pub fn details(&self) -> ErrorDetails {
        match self {
            Self::VerifyFailed {
                artifact,
                expected_sha256,
                actual_sha256,
            } => ErrorDetails {
                artifact: Some(artifact.clone()),
                expected_sha256: Some(expected_sha256.clone()),
                actual_sha256: Some(actual_sha256.clone()),
                ..Default::default()
            },
            Self::RuntimeNotAvailable { details, .. } | Self::DownloadFailed { details, .. } => {
                details.as_ref().clone()
            }
            Self::InsufficientMemory {
                required_bytes,
                available_bytes,
            } => ErrorDetails {
                required_bytes: Some(*required_bytes),
                available_bytes: Some(*available_bytes),
                ..Default::default()
            },
            _ => ErrorDetails::default(),
        }
    }

    /// Optional hint for user-facing callers.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::VerifyFailed { .. } => {
                Some("retry the install; the download will start over".into())
            }
            Self::InsufficientMemory { .. } => {
                Some("close other applications or pick a smaller model variant".into())
            }
            Self::DownloadFailed { .. } => Some("check connectivity and retry".into()),
            _ => None,
        }
    }

    /// Convert into the serializable wire form.
    pub fn to_wire(&self) -> WireError {
        let details = self.details();
        WireError {
            code: self.code(),
            message: self.to_string(),
            retriable: self.retriable(),
            details: if details.is_empty() {
                None
            } else {
                Some(details)
            },
            suggestion: self.suggestion(),
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        let details = wire.details.unwrap_or_default();
        match wire.code {
            ErrorCode::ModelNotFound => Self::ModelNotFound(wire.message),
            ErrorCode::ModelVerifyFailed => Self::VerifyFailed {
                artifact: details.artifact.unwrap_or_default(),
                expected_sha256: details.expected_sha256.unwrap_or_default(),
                actual_sha256: details.actual_sha256.unwrap_or_default(),
            },
            ErrorCode::RuntimeNotAvailable => Self::RuntimeNotAvailable {
                message: wire.message,
                details: Box::new(details),
            },
            ErrorCode::UnsupportedPlatform => Self::UnsupportedPlatform {
                message: wire.message,
            },
            ErrorCode::InsufficientMemory => Self::InsufficientMemory {
                required_bytes: details.required_bytes.unwrap_or_default(),
                available_bytes: details.available_bytes.unwrap_or_default(),
            },
            ErrorCode::TaskTimeout => Self::TaskTimeout(Duration::ZERO),
            ErrorCode::TaskCancelled => Self::TaskCancelled,
            ErrorCode::DownloadFailed => Self::DownloadFailed {
                message: wire.message,
                details: Box::new(details),
            },
            ErrorCode::InvalidModelFormat => Self::InvalidModelFormat(wire.message),
            ErrorCode::ConfigError => Self::ConfigError(wire.message),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::download_io(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::download(err.to_string())
    }
}
