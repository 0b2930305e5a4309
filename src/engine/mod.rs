// ==========================================
// 生产批次追溯引擎 - 引擎层
// ==========================================
// 职责: 实现业务规则与状态机,不拼 SQL
// 红线: 每个变更入口一个写事务; 所有拒绝必须带结构化原因
// ==========================================

pub mod accountability;
pub mod buffer_inventory;
pub mod codes;
pub mod compliance;
pub mod error;
pub mod genealogy;
pub mod lot_registration;
pub mod qc_gate;
pub mod repositories;
pub mod run_lifecycle;
pub mod temperature_log;

// 重导出核心引擎
pub use buffer_inventory::{BufferInventoryManager, TransferOutcome};
pub use compliance::{
    ComplianceChecker, ComplianceRule, CompositionContext, RuleViolation, SameDayIntermediateRule,
};
pub use error::{EngineError, EngineResult};
pub use genealogy::GenealogyEngine;
pub use lot_registration::{LotRegistrationService, RegisteredLot};
pub use qc_gate::{GateOutcome, QcGateEngine};
pub use repositories::TraceRepositories;
pub use run_lifecycle::{
    next_status, AdvanceOutcome, CreateOutcome, CreateRunRequest, RunLifecycleEngine,
};
pub use temperature_log::TemperatureLogEngine;
