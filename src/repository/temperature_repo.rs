// ==========================================
// 生产批次追溯引擎 - 温度记录仓储
// ==========================================
// 红线: temperature_logs 只追加
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::temperature::{TemperatureLog, TemperatureLogFilter};
use crate::domain::types::MeasurementType;
use crate::repository::error::RepositoryResult;
use crate::repository::row_codec::{format_ts, parse_enum, parse_ts};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;
use std::time::Duration;

const LOG_COLUMNS: &str = "log_id, measurement_type, temperature_c, lot_id, buffer_id, \
                           is_violation, recorded_by, recorded_at";

/// 未指定条数时的默认上限
pub const DEFAULT_LIST_LIMIT: usize = 50;

pub struct TemperatureRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl TemperatureRepository {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn, self.timeout)
    }

    pub fn insert_tx(conn: &Connection, log: &TemperatureLog) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO temperature_logs (
                log_id, measurement_type, temperature_c, lot_id, buffer_id,
                is_violation, recorded_by, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                log.log_id,
                log.measurement_type.to_db_str(),
                log.temperature_c,
                log.lot_id,
                log.buffer_id,
                log.is_violation,
                log.recorded_by,
                format_ts(&log.recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, log_id: &str) -> RepositoryResult<Option<TemperatureLog>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM temperature_logs WHERE log_id = ?1", LOG_COLUMNS);
        let log = conn
            .query_row(&sql, params![log_id], Self::map_log)
            .optional()?;
        Ok(log)
    }

    /// 按条件查询 (最新在前)
    pub fn list(&self, filter: &TemperatureLogFilter) -> RepositoryResult<Vec<TemperatureLog>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM temperature_logs
             WHERE (?1 IS NULL OR lot_id = ?1)
               AND (?2 IS NULL OR buffer_id = ?2)
               AND (?3 = 0 OR is_violation = 1)
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?4 OFFSET ?5",
            LOG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(
                params![
                    filter.lot_id,
                    filter.buffer_id,
                    filter.violations_only,
                    filter.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64,
                    filter.offset.unwrap_or(0) as i64,
                ],
                Self::map_log,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    fn map_log(row: &Row) -> rusqlite::Result<TemperatureLog> {
        let measurement_type: String = row.get(1)?;
        let recorded_at: String = row.get(7)?;
        Ok(TemperatureLog {
            log_id: row.get(0)?,
            measurement_type: parse_enum(1, &measurement_type, MeasurementType::from_db_str)?,
            temperature_c: row.get(2)?,
            lot_id: row.get(3)?,
            buffer_id: row.get(4)?,
            is_violation: row.get(5)?,
            recorded_by: row.get(6)?,
            recorded_at: parse_ts(7, &recorded_at)?,
        })
    }
}
