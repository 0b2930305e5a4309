// ==========================================
// 生产批次追溯引擎 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、业务规则接口
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod buffer;
pub mod flow;
pub mod genealogy;
pub mod lot;
pub mod qc;
pub mod run;
pub mod temperature;
pub mod types;

// 重导出核心类型
pub use buffer::{Buffer, BufferInventory, BufferInventoryEntry, BufferSummary};
pub use flow::{FlowStep, FlowVersion};
pub use genealogy::{GenealogyGraph, TraceabilityView};
pub use lot::{GenealogyLink, Lot, LotRegistration, ParentDeclaration};
pub use qc::{NewQcDecision, QcDecision, QcGate};
pub use run::{ProductionRun, RunAction, RunEvent, RunStepExecution};
pub use temperature::{NewTemperatureLog, TemperatureLog, TemperatureLogFilter};
pub use types::{
    Decision, FlowVersionStatus, GateType, LotType, MeasurementType, RunStatus,
    StepExecutionStatus, TraversalDirection,
};
