use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("user is not authenticated to perform this action.")]
    Authentication {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("user is not authorized to perform this action.")]
    Authorization {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("could not find resource")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("duplicate resource")]
    Duplicate {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("configuration is invalid")]
    Validation {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("invalid request")]
    InvalidRequest {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("protocol error")]
    Protocol {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("transport error")]
    Transport {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("operation timed out")]
    Timeout {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("repository error")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("sqlite database error")]
    SqliteError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("tokio channel error")]
    TokioChannelError {
        #[serde(skip)]
        #[source]
        source: DynError,
    },
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("serde yaml error")]
    SerdeYamlError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_yaml::Error,
    },
    #[error("axum error")]
    AxumError {
        #[serde(skip)]
        #[from]
        #[source]
        source: axum::Error,
    },
    #[error("address parse error")]
    AddrParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("reqwest error")]
    ReqwestError {
        #[serde(skip)]
        #[from]
        #[source]
        source: reqwest::Error,
    },
}

impl CommonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CommonError::Validation {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn not_found(msg: impl Into<String>, lookup_id: impl Into<String>) -> Self {
        CommonError::NotFound {
            msg: msg.into(),
            lookup_id: lookup_id.into(),
            source: None,
        }
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        CommonError::Duplicate {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        CommonError::InvalidRequest {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CommonError::Protocol {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        CommonError::Transport {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        CommonError::Timeout {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        CommonError::Repository {
            msg: msg.into(),
            source: None,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommonError::Transport { .. }
                | CommonError::Timeout { .. }
                | CommonError::IoError { .. }
                | CommonError::ReqwestError { .. }
        )
    }
}

impl<T: Send + Sync + 'static> From<tokio::sync::mpsc::error::SendError<T>> for CommonError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CommonError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    name: String,
    message: String,
}

impl IntoResponse for CommonError {
    fn into_response(self) -> Response {
        let status = match self {
            CommonError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            CommonError::Authorization { .. } => StatusCode::FORBIDDEN,
            CommonError::NotFound { .. } => StatusCode::NOT_FOUND,
            CommonError::Duplicate { .. } => StatusCode::CONFLICT,
            CommonError::Validation { .. } | CommonError::InvalidRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            name: match self {
                CommonError::Authentication { .. } => "Authentication",
                CommonError::Authorization { .. } => "Authorization",
                CommonError::NotFound { .. } => "NotFound",
                CommonError::Duplicate { .. } => "Duplicate",
                CommonError::Validation { .. } => "Validation",
                CommonError::InvalidRequest { .. } => "InvalidRequest",
                CommonError::Protocol { .. } => "Protocol",
                CommonError::Transport { .. } => "Transport",
                CommonError::Timeout { .. } => "Timeout",
                _ => "InternalServerError",
            }
            .to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
