use http::StatusCode;

use ccrouter_transform::TransformError;

use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("request canceled by caller")]
    Canceled,
    #[error("invalid request body: {0}")]
    BadRequest(String),
    #[error("no route matched and no default is configured")]
    NoRoute,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("upstream request failed: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for RouterError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Canceled => RouterError::Canceled,
            other => RouterError::Engine(other),
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(error: serde_json::Error) -> Self {
        RouterError::BadRequest(error.to_string())
    }
}

impl RouterError {
    pub fn status(&self) -> StatusCode {
        match self {
            // Non-standard "client closed request"; the caller is gone
            // either way.
            RouterError::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RouterError::NoRoute | RouterError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            RouterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Transform(_) => StatusCode::BAD_REQUEST,
            RouterError::Engine(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
