// ==========================================
// 生产批次追溯引擎 - 温度记录
// ==========================================
// 职责: 登记表面/中心/环境温度读数,按测量类型阈值判定超限
// 红线: 超限标记由服务端计算,调用方不可指定
// 红线: 关联的批次/缓冲区必须存在
// ==========================================

use crate::config::EngineSettings;
use crate::db::with_write_tx;
use crate::domain::temperature::{
    NewTemperatureLog, TemperatureLog, TemperatureLogFilter, MAX_READING_C, MIN_READING_C,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{BufferRepository, LotRepository, TemperatureRepository};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// 单次查询最大条数
pub const MAX_LIST_LIMIT: usize = 500;

pub struct TemperatureLogEngine {
    repos: TraceRepositories,
    settings: EngineSettings,
}

impl TemperatureLogEngine {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self { repos, settings }
    }

    /// 登记温度读数
    ///
    /// # 返回
    /// - Ok(TemperatureLog): 含超限判定的新记录
    /// - Err(Validation): 读数越界或记录人为空
    /// - Err(NotFound): 关联批次/缓冲区不存在
    pub fn record(
        &self,
        input: NewTemperatureLog,
        recorded_by: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<TemperatureLog> {
        if recorded_by.trim().is_empty() {
            return Err(EngineError::validation("recorded_by", "记录人不能为空"));
        }
        let t = input.temperature_c;
        if !t.is_finite() || !(MIN_READING_C..=MAX_READING_C).contains(&t) {
            return Err(EngineError::validation(
                "temperature_c",
                format!("温度读数必须在 [{}, {}] 之间", MIN_READING_C, MAX_READING_C),
            ));
        }

        let log = TemperatureLog {
            log_id: Uuid::new_v4().to_string(),
            measurement_type: input.measurement_type,
            temperature_c: t,
            lot_id: normalize_id(input.lot_id),
            buffer_id: normalize_id(input.buffer_id),
            is_violation: input.measurement_type.is_violation(t),
            recorded_by: recorded_by.trim().to_string(),
            recorded_at: now,
        };

        with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            if let Some(lot_id) = &log.lot_id {
                if LotRepository::find_by_id_tx(tx, lot_id)?.is_none() {
                    return Err(EngineError::not_found("Lot", lot_id));
                }
            }
            if let Some(buffer_id) = &log.buffer_id {
                if BufferRepository::find_by_id_tx(tx, buffer_id)?.is_none() {
                    return Err(EngineError::not_found("Buffer", buffer_id));
                }
            }
            TemperatureRepository::insert_tx(tx, &log)?;
            Ok(())
        })?;

        if log.is_violation {
            warn!(
                log_id = %log.log_id,
                measurement_type = %log.measurement_type,
                temperature_c = log.temperature_c,
                max_allowed_c = log.measurement_type.max_allowed_c(),
                lot_id = ?log.lot_id,
                buffer_id = ?log.buffer_id,
                "温度超限"
            );
        } else {
            info!(
                log_id = %log.log_id,
                measurement_type = %log.measurement_type,
                temperature_c = log.temperature_c,
                "温度记录已登记"
            );
        }
        Ok(log)
    }

    pub fn get(&self, log_id: &str) -> EngineResult<TemperatureLog> {
        self.repos
            .temperature_repo
            .find_by_id(log_id)?
            .ok_or_else(|| EngineError::not_found("TemperatureLog", log_id))
    }

    /// 按批次/缓冲区/超限筛选 (最新在前)
    pub fn list(&self, filter: &TemperatureLogFilter) -> EngineResult<Vec<TemperatureLog>> {
        if let Some(limit) = filter.limit {
            if limit == 0 || limit > MAX_LIST_LIMIT {
                return Err(EngineError::validation(
                    "limit",
                    format!("limit 必须在 1..={} 之间", MAX_LIST_LIMIT),
                ));
            }
        }
        Ok(self.repos.temperature_repo.list(filter)?)
    }
}

fn normalize_id(id: Option<String>) -> Option<String> {
    id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
