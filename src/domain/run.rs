// ==========================================
// 生产批次追溯引擎 - 生产运行领域模型
// ==========================================
// 红线: 状态迁移是运行记录唯一的变更方式; 运行从不删除,只归档
// 并发: revision 字段用于乐观锁
// ==========================================

use crate::domain::types::{RunStatus, StepExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// ProductionRun - 生产运行
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRun {
    pub run_id: String,
    pub run_code: String, // RUN-YYYYMMDD-SITE-####
    pub flow_version_id: String,
    pub status: RunStatus,
    pub current_step_index: i32,
    pub idempotency_key: String,
    pub daily_target_kg: Option<f64>,
    pub created_by: String,

    // ===== 时间戳 =====
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>, // 完成或中止时间

    // ===== 责任说明 =====
    pub hold_reason: Option<String>,
    pub abort_reason: Option<String>,

    pub revision: i32, // 乐观锁版本号
}

// ==========================================
// RunStepExecution - 工序执行记录
// ==========================================
// 每个 (run_id, step_index) 仅一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStepExecution {
    pub execution_id: String,
    pub run_id: String,
    pub step_index: i32,
    pub node_id: String,
    pub status: StepExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub operator_id: Option<String>,
    pub notes: Option<String>,
}

// ==========================================
// RunAction - 运行事件类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunAction {
    Create,
    Start,
    Advance,
    Hold,
    Resume,
    Complete,
    Abort,
    Archive,
}

impl RunAction {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(RunAction::Create),
            "START" => Some(RunAction::Start),
            "ADVANCE" => Some(RunAction::Advance),
            "HOLD" => Some(RunAction::Hold),
            "RESUME" => Some(RunAction::Resume),
            "COMPLETE" => Some(RunAction::Complete),
            "ABORT" => Some(RunAction::Abort),
            "ARCHIVE" => Some(RunAction::Archive),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            RunAction::Create => "CREATE",
            RunAction::Start => "START",
            RunAction::Advance => "ADVANCE",
            RunAction::Hold => "HOLD",
            RunAction::Resume => "RESUME",
            RunAction::Complete => "COMPLETE",
            RunAction::Abort => "ABORT",
            RunAction::Archive => "ARCHIVE",
        }
    }
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// RunEvent - 运行审计事件
// ==========================================
// 红线: 所有状态迁移必须记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: String,
    pub run_id: String,
    pub action: RunAction,
    pub from_status: Option<RunStatus>, // CREATE 事件为空
    pub to_status: RunStatus,
    pub step_index: i32,
    pub actor: String,
    pub detail: Option<String>, // 暂停原因 / 恢复说明 / 中止原因 / 推进备注
    pub occurred_at: DateTime<Utc>,
}
