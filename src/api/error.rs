// ==========================================
// 生产批次追溯引擎 - API层错误类型
// ==========================================
// 职责: 包装引擎错误,补充权限与输入错误,映射 HTTP 状态码
// 红线: 每个错误都带显式原因与机器可读错误码
// ==========================================

use crate::engine::error::EngineError;
use crate::repository::error::RepositoryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("权限不足: {0}")]
    Forbidden(String),

    #[error("无效输入: {0}")]
    InvalidInput(String),
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        ApiError::Engine(EngineError::from(err))
    }
}

/// 结构化错误响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ApiError {
    /// HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Forbidden(_) => 403,
            ApiError::InvalidInput(_) => 422,
            ApiError::Engine(e) => match e {
                EngineError::Validation { .. }
                | EngineError::ComplianceViolation { .. }
                | EngineError::TemperatureOutOfRange { .. } => 422,
                EngineError::InvalidTransition { .. }
                | EngineError::GateBlocked { .. }
                | EngineError::StepsRemaining { .. }
                | EngineError::AtTerminalStep { .. }
                | EngineError::BufferPolicyViolation { .. }
                | EngineError::Conflict(_) => 409,
                EngineError::NotFound { .. } => 404,
                EngineError::StorageUnavailable(_) => 503,
                EngineError::Storage(_) => 500,
            },
        }
    }

    /// 机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::Engine(e) => e.code(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status_code(),
            detail: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

#[cfg(feature = "http-server")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self.to_body())).into_response()
    }
}

#[cfg(feature = "http-server")]
impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        ApiError::InvalidInput(format!("请求体 JSON 无效: {}", rejection.body_text()))
    }
}

#[cfg(feature = "http-server")]
impl From<axum::extract::rejection::QueryRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::QueryRejection) -> Self {
        ApiError::InvalidInput(format!("查询参数无效: {}", rejection.body_text()))
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
