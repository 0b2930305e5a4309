// ==========================================
// 生产批次追溯引擎 - 引擎层仓储聚合
// ==========================================
// 职责: 聚合引擎所需的所有 Repository 与共享连接
// 写操作: 通过 `conn` 开启单个写事务,组合各仓储的 `*_tx` 函数
// ==========================================

use std::sync::Arc;
use std::time::Duration;

use crate::db::SharedConnection;
use crate::repository::{
    BufferRepository, FlowRepository, LotRepository, QcRepository, RunRepository,
    TemperatureRepository,
};

/// 追溯引擎仓储集合
#[derive(Clone)]
pub struct TraceRepositories {
    /// 共享连接 (写事务入口)
    pub conn: SharedConnection,
    pub lot_repo: Arc<LotRepository>,
    pub run_repo: Arc<RunRepository>,
    pub flow_repo: Arc<FlowRepository>,
    pub qc_repo: Arc<QcRepository>,
    pub buffer_repo: Arc<BufferRepository>,
    pub temperature_repo: Arc<TemperatureRepository>,
}

impl TraceRepositories {
    /// 基于同一连接创建全部仓储
    ///
    /// # 参数
    /// - conn: 共享连接
    /// - timeout: 每次获取连接的超时
    pub fn new(conn: SharedConnection, timeout: Duration) -> Self {
        Self {
            lot_repo: Arc::new(LotRepository::new(conn.clone()).with_timeout(timeout)),
            run_repo: Arc::new(RunRepository::new(conn.clone()).with_timeout(timeout)),
            flow_repo: Arc::new(FlowRepository::new(conn.clone()).with_timeout(timeout)),
            qc_repo: Arc::new(QcRepository::new(conn.clone()).with_timeout(timeout)),
            buffer_repo: Arc::new(BufferRepository::new(conn.clone()).with_timeout(timeout)),
            temperature_repo: Arc::new(
                TemperatureRepository::new(conn.clone()).with_timeout(timeout),
            ),
            conn,
        }
    }
}
