// ==========================================
// 生产批次追溯引擎 - 核心库
// ==========================================
// 职责: 生产运行生命周期、批次谱系与追溯、质检关卡、缓冲区库存、温度记录
// 技术栈: Rust + SQLite
// 分层: domain → repository → engine → api → app
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则与状态机
pub mod engine;

// 配置层 - 引擎参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA/事务）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 授权与业务接口
pub mod api;

// 应用层 - 状态装配与 HTTP
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

pub use domain::types::{
    Decision, FlowVersionStatus, GateType, LotType, MeasurementType, RunStatus,
    StepExecutionStatus, TraversalDirection,
};

pub use domain::{
    Buffer, BufferInventory, FlowVersion, GenealogyGraph, GenealogyLink, Lot, LotRegistration,
    ProductionRun, QcDecision, QcGate, RunEvent, RunStepExecution, TemperatureLog,
    TraceabilityView,
};

pub use engine::{
    BufferInventoryManager, ComplianceChecker, EngineError, GenealogyEngine,
    LotRegistrationService, QcGateEngine, RunLifecycleEngine, TemperatureLogEngine,
};

pub use api::{ApiError, Caller, Role};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "生产批次追溯引擎";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
