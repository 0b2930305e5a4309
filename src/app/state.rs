// ==========================================
// 生产批次追溯引擎 - 应用状态
// ==========================================
// 职责: 装配连接、配置、引擎与 API 实例,供 HTTP 层共享
// 红线: 不持有任何"当前运行"之类的全局可变状态
// ==========================================

use std::sync::Arc;

use crate::api::{
    BufferApi, GenealogyApi, LotApi, QcApi, RolePolicy, RunApi, StaticRolePolicy,
    TemperatureApi,
};
use crate::config::{ConfigManager, EngineSettings};
use crate::db::{open_shared, SharedConnection};
use crate::engine::{
    BufferInventoryManager, GenealogyEngine, LotRegistrationService, QcGateEngine,
    RunLifecycleEngine, TemperatureLogEngine, TraceRepositories,
};

/// 默认数据库文件名
const DB_FILE_NAME: &str = "haccp_trace.db";

/// 应用状态
///
/// 所有 API 实例共享同一个连接
#[derive(Clone)]
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 引擎参数快照
    pub settings: EngineSettings,

    pub run_api: Arc<RunApi>,
    pub lot_api: Arc<LotApi>,
    pub qc_api: Arc<QcApi>,
    pub genealogy_api: Arc<GenealogyApi>,
    pub buffer_api: Arc<BufferApi>,
    pub temperature_api: Arc<TemperatureApi>,
}

impl AppState {
    /// 打开数据库 (建表 + 种子数据) 并装配全部实例
    ///
    /// # 返回
    /// - Err(String): 数据库无法打开或配置读取失败
    pub fn new(db_path: String) -> Result<Self, String> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        let conn = open_shared(&db_path).map_err(|e| format!("无法打开数据库: {}", e))?;
        Self::from_connection(db_path, conn)
    }

    /// 基于已初始化的共享连接装配 (测试可直接传入临时库)
    pub fn from_connection(db_path: String, conn: SharedConnection) -> Result<Self, String> {
        let config = ConfigManager::from_connection(conn.clone())
            .map_err(|e| format!("无法初始化配置管理器: {}", e))?;
        let settings = config
            .load_settings()
            .map_err(|e| format!("无法加载引擎配置: {}", e))?;
        tracing::info!(
            site_code = %settings.site_code,
            storage_timeout_ms = settings.storage_timeout_ms,
            "引擎配置已加载"
        );

        Ok(Self::with_policy(
            db_path,
            conn,
            settings,
            Arc::new(StaticRolePolicy),
        ))
    }

    /// 指定授权策略装配
    pub fn with_policy(
        db_path: String,
        conn: SharedConnection,
        settings: EngineSettings,
        policy: Arc<dyn RolePolicy>,
    ) -> Self {
        let repos = TraceRepositories::new(conn, settings.storage_timeout());

        // ==========================================
        // 引擎层
        // ==========================================
        let run_engine = Arc::new(RunLifecycleEngine::new(repos.clone(), settings.clone()));
        let lot_service = Arc::new(LotRegistrationService::new(repos.clone(), settings.clone()));
        let qc_engine = Arc::new(QcGateEngine::new(repos.clone(), settings.clone()));
        let genealogy_engine = Arc::new(GenealogyEngine::new(repos.clone(), settings.clone()));
        let buffer_manager =
            Arc::new(BufferInventoryManager::new(repos.clone(), settings.clone()));
        let temperature_engine = Arc::new(TemperatureLogEngine::new(repos, settings.clone()));

        // ==========================================
        // API 层
        // ==========================================
        Self {
            db_path,
            run_api: Arc::new(RunApi::new(run_engine, policy.clone())),
            lot_api: Arc::new(LotApi::new(
                lot_service.clone(),
                genealogy_engine.clone(),
                policy.clone(),
            )),
            qc_api: Arc::new(QcApi::new(qc_engine, policy.clone())),
            genealogy_api: Arc::new(GenealogyApi::new(
                genealogy_engine,
                lot_service,
                policy.clone(),
            )),
            buffer_api: Arc::new(BufferApi::new(buffer_manager, policy.clone())),
            temperature_api: Arc::new(TemperatureApi::new(temperature_engine, policy)),
            settings,
        }
    }
}

/// 默认数据库路径
///
/// 优先级: HACCP_TRACE_DB_PATH 环境变量 > 用户数据目录 > 当前目录
pub fn get_default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var("HACCP_TRACE_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from(format!("./{}", DB_FILE_NAME));

    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("haccp-trace");
        // 目录创建失败时回退到当前目录
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join(DB_FILE_NAME);
        }
    }

    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Caller, Role};
    use crate::db::open_in_memory_shared;

    #[test]
    fn test_state_wires_shared_connection() {
        let state =
            AppState::from_connection(":memory:".to_string(), open_in_memory_shared().unwrap())
                .unwrap();
        let viewer = Caller::new("v1", Role::Viewer);
        assert_eq!(state.buffer_api.list(&viewer).unwrap().len(), 5);
        assert_eq!(state.qc_api.list_gates(&viewer).unwrap().len(), 4);
        assert!(state.run_api.list(&viewer, None).unwrap().is_empty());
        assert!(state
            .temperature_api
            .list(&viewer, Default::default())
            .unwrap()
            .is_empty());
    }
}
