// ==========================================
// 生产批次追溯引擎 - 访问控制
// ==========================================
// 调用方身份由外部认证层提供 (用户ID + 角色),本层只做授权判定
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    Auditor,
    Operator,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "MANAGER" => Some(Role::Manager),
            "AUDITOR" => Some(Role::Auditor),
            "OPERATOR" => Some(Role::Operator),
            "VIEWER" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::Auditor => "AUDITOR",
            Role::Operator => "OPERATOR",
            Role::Viewer => "VIEWER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// 需要授权的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateRun,
    StartRun,
    AdvanceRun,
    HoldRun,
    CompleteRun,
    ResumeRun,
    AbortRun,
    ArchiveRun,
    RegisterLot,
    LinkLots,
    MoveBuffer,
    RecordQcDecision,
    RecordTemperature,
    Read,
}

// ==========================================
// RolePolicy Trait
// ==========================================
pub trait RolePolicy: Send + Sync {
    fn allows(&self, role: Role, op: Operation) -> bool;

    /// 授权判定,拒绝返回 Forbidden
    fn authorize(&self, caller: &Caller, op: Operation) -> ApiResult<()> {
        if self.allows(caller.role, op) {
            return Ok(());
        }
        warn!(
            user_id = %caller.user_id,
            role = %caller.role,
            operation = ?op,
            "操作被拒绝: 权限不足"
        );
        Err(ApiError::Forbidden(format!(
            "角色 {} 无权执行 {:?}",
            caller.role, op
        )))
    }
}

/// 默认静态权限表
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRolePolicy;

impl RolePolicy for StaticRolePolicy {
    fn allows(&self, role: Role, op: Operation) -> bool {
        use Operation as O;
        match op {
            O::CreateRun
            | O::StartRun
            | O::AdvanceRun
            | O::HoldRun
            | O::CompleteRun
            | O::RegisterLot
            | O::LinkLots
            | O::MoveBuffer => matches!(role, Role::Admin | Role::Manager | Role::Operator),
            O::ResumeRun | O::AbortRun | O::ArchiveRun => {
                matches!(role, Role::Admin | Role::Manager)
            }
            O::RecordQcDecision | O::RecordTemperature => role != Role::Viewer,
            O::Read => true,
        }
    }
}
