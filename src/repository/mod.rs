// ==========================================
// 生产批次追溯引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化
// 事务: `*_tx` 关联函数接收外部连接/事务,由引擎层组合进单个写事务
// ==========================================

pub mod buffer_repo;
pub mod error;
pub mod flow_repo;
pub mod lot_repo;
pub mod qc_repo;
pub mod row_codec;
pub mod run_repo;
pub mod temperature_repo;

// 重导出核心仓储
pub use buffer_repo::BufferRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use flow_repo::FlowRepository;
pub use lot_repo::LotRepository;
pub use qc_repo::QcRepository;
pub use run_repo::RunRepository;
pub use temperature_repo::TemperatureRepository;
