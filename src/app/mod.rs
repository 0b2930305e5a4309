// ==========================================
// 生产批次追溯引擎 - 应用层
// ==========================================
// 职责: 装配应用状态; 对外提供 HTTP 接口
// ==========================================

pub mod state;

#[cfg(feature = "http-server")]
pub mod http;

// 重导出
pub use state::{get_default_db_path, AppState};

#[cfg(feature = "http-server")]
pub use http::{create_router, serve};
