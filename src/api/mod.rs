// ==========================================
// 生产批次追溯引擎 - API 层
// ==========================================
// 职责: 授权判定 + 入参整理,委托引擎; 供 HTTP 层调用
// ==========================================

pub mod access;
pub mod buffer_api;
pub mod error;
pub mod genealogy_api;
pub mod lot_api;
pub mod qc_api;
pub mod run_api;
pub mod temperature_api;

// 重导出核心类型
pub use access::{Caller, Operation, Role, RolePolicy, StaticRolePolicy};
pub use buffer_api::{BufferApi, PlaceLotBody, RemoveOutcome, TransferBody};
pub use error::{ApiError, ApiResult, ErrorBody};
pub use genealogy_api::GenealogyApi;
pub use lot_api::{LinkBody, LotApi};
pub use qc_api::QcApi;
pub use run_api::{AdvanceBody, CreateRunBody, ReasonBody, ResolutionBody, RunApi};
pub use temperature_api::TemperatureApi;
