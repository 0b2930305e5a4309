// ==========================================
// 生产批次追溯引擎 - 引擎层错误类型
// ==========================================
// 红线: 违规从不静默降级为告警,每个拒绝都携带可操作的结构化信息
// 红线: 引擎内部不做重试
// ==========================================

use crate::domain::types::RunStatus;
use crate::repository::error::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // ===== 调用方输入错误 =====
    #[error("数据验证失败 (field={field}): {message}")]
    Validation { field: String, message: String },

    // ===== 状态机 =====
    #[error("无效的状态转换: run={run_id}, status={from}, action={action}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        action: String,
    },

    #[error("质检关卡阻断: run={run_id}, step={step_index}, gate={gate_code}: {reason}")]
    GateBlocked {
        run_id: String,
        step_index: i32,
        gate_code: String,
        reason: String,
    },

    #[error("仍有未完成工序: run={run_id}, current_step={current_step}, final_step={final_step}")]
    StepsRemaining {
        run_id: String,
        current_step: i32,
        final_step: i32,
    },

    #[error("已到最终工序,请调用 complete: run={run_id}, step={step_index}")]
    AtTerminalStep { run_id: String, step_index: i32 },

    // ===== 合规与物理约束 =====
    #[error("合规规则违反 [{rule_id}]: {message}")]
    ComplianceViolation { rule_id: String, message: String },

    #[error("缓冲区策略违反 (buffer={buffer_id}): {message}")]
    BufferPolicyViolation { buffer_id: String, message: String },

    #[error("温度超出范围 (buffer={buffer_id}): {temperature_c}°C 不在 [{min}, {max}]")]
    TemperatureOutOfRange {
        buffer_id: String,
        temperature_c: f64,
        min: String,
        max: String,
    },

    // ===== 存储 =====
    #[error("存储暂不可用: {0}")]
    StorageUnavailable(String),

    #[error("记录未找到: {entity} with id={id}")]
    NotFound { entity: String, id: String },

    #[error("并发修改冲突: {0}")]
    Conflict(String),

    #[error("存储错误: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        EngineError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// 机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::GateBlocked { .. } => "GATE_BLOCKED",
            EngineError::StepsRemaining { .. } => "STEPS_REMAINING",
            EngineError::AtTerminalStep { .. } => "AT_TERMINAL_STEP",
            EngineError::ComplianceViolation { .. } => "COMPLIANCE_VIOLATION",
            EngineError::BufferPolicyViolation { .. } => "BUFFER_POLICY_VIOLATION",
            EngineError::TemperatureOutOfRange { .. } => "TEMPERATURE_OUT_OF_RANGE",
            EngineError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// 调用方是否可以退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StorageUnavailable(_) | EngineError::Conflict(_)
        )
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::StorageUnavailable(msg) => EngineError::StorageUnavailable(msg),
            RepositoryError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            RepositoryError::OptimisticLockFailure { entity, id, expected } => {
                EngineError::Conflict(format!(
                    "{} id={} 已被并发修改 (expected_revision={})",
                    entity, id, expected
                ))
            }
            RepositoryError::UniqueConstraintViolation(msg) => EngineError::Conflict(msg),
            RepositoryError::ForeignKeyViolation(msg) => EngineError::validation("reference", msg),
            RepositoryError::ValidationError(msg) => EngineError::validation("input", msg),
            RepositoryError::FieldValueError { field, message } => {
                EngineError::Validation { field, message }
            }
            RepositoryError::LockError(msg) | RepositoryError::DatabaseQueryError(msg) => {
                EngineError::Storage(msg)
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_mapping() {
        let e: EngineError = RepositoryError::StorageUnavailable("busy".into()).into();
        assert!(matches!(e, EngineError::StorageUnavailable(_)));
        assert!(e.is_retryable());

        let e: EngineError = RepositoryError::OptimisticLockFailure {
            entity: "ProductionRun".into(),
            id: "R1".into(),
            expected: 3,
        }
        .into();
        assert_eq!(e.code(), "CONFLICT");

        let e: EngineError = RepositoryError::not_found("Lot", "L1").into();
        assert_eq!(e, EngineError::not_found("Lot", "L1"));
    }
}
