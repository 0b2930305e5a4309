// ==========================================
// 生产批次追溯引擎 - 缓冲区与库存条目仓储
// ==========================================
// 在库条目: exited_at IS NULL
// 约束: 同一缓冲区内同一批次最多一条在库条目 (部分唯一索引)
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::buffer::{Buffer, BufferInventoryEntry};
use crate::domain::types::LotType;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_codec::{format_ts, parse_opt_ts, parse_ts};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;
use std::time::Duration;

const BUFFER_COLUMNS: &str = "buffer_id, buffer_code, buffer_type, allowed_lot_types, \
                              capacity_kg, temp_min_c, temp_max_c, is_active";

const ENTRY_COLUMNS: &str = "entry_id, buffer_id, lot_id, run_id, quantity_kg, temperature_c, \
                             entered_at, exited_at";

pub struct BufferRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl BufferRepository {
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

    // ==========================================
    // 缓冲区配置
    // ==========================================

    pub fn list_all(&self) -> RepositoryResult<Vec<Buffer>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM buffers ORDER BY buffer_code", BUFFER_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let buffers = stmt
            .query_map([], Self::map_buffer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buffers)
    }

    pub fn find_by_id_tx(conn: &Connection, buffer_id: &str) -> RepositoryResult<Option<Buffer>> {
        let sql = format!("SELECT {} FROM buffers WHERE buffer_id = ?1", BUFFER_COLUMNS);
        let buffer = conn
            .query_row(&sql, params![buffer_id], Self::map_buffer)
            .optional()?;
        Ok(buffer)
    }

    pub fn insert_tx(conn: &Connection, buffer: &Buffer) -> RepositoryResult<()> {
        let allowed: Vec<&str> = buffer
            .allowed_lot_types
            .iter()
            .map(|t| t.to_db_str())
            .collect();
        let allowed_json = serde_json::to_string(&allowed)
            .map_err(|e| RepositoryError::FieldValueError {
                field: "allowed_lot_types".to_string(),
                message: e.to_string(),
            })?;
        conn.execute(
            r#"
            INSERT INTO buffers (
                buffer_id, buffer_code, buffer_type, allowed_lot_types,
                capacity_kg, temp_min_c, temp_max_c, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                buffer.buffer_id,
                buffer.buffer_code,
                buffer.buffer_type,
                allowed_json,
                buffer.capacity_kg,
                buffer.temp_min_c,
                buffer.temp_max_c,
                buffer.is_active,
            ],
        )?;
        Ok(())
    }

    // ==========================================
    // 库存条目
    // ==========================================

    /// 缓冲区当前在库条目 (按入库时间升序)
    pub fn open_entries_tx(
        conn: &Connection,
        buffer_id: &str,
    ) -> RepositoryResult<Vec<BufferInventoryEntry>> {
        let sql = format!(
            "SELECT {} FROM buffer_entries WHERE buffer_id = ?1 AND exited_at IS NULL
             ORDER BY entered_at, rowid",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![buffer_id], Self::map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// 在库总量 (kg)
    pub fn open_total_kg_tx(conn: &Connection, buffer_id: &str) -> RepositoryResult<f64> {
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(quantity_kg), 0.0) FROM buffer_entries
             WHERE buffer_id = ?1 AND exited_at IS NULL",
            params![buffer_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn open_entry_for_lot_tx(
        conn: &Connection,
        buffer_id: &str,
        lot_id: &str,
    ) -> RepositoryResult<Option<BufferInventoryEntry>> {
        let sql = format!(
            "SELECT {} FROM buffer_entries
             WHERE buffer_id = ?1 AND lot_id = ?2 AND exited_at IS NULL",
            ENTRY_COLUMNS
        );
        let entry = conn
            .query_row(&sql, params![buffer_id, lot_id], Self::map_entry)
            .optional()?;
        Ok(entry)
    }

    /// 某运行在各缓冲区的在库条目
    pub fn open_entries_for_run(&self, run_id: &str) -> RepositoryResult<Vec<BufferInventoryEntry>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM buffer_entries WHERE run_id = ?1 AND exited_at IS NULL
             ORDER BY buffer_id, entered_at, rowid",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![run_id], Self::map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn insert_entry_tx(conn: &Connection, entry: &BufferInventoryEntry) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO buffer_entries (
                entry_id, buffer_id, lot_id, run_id, quantity_kg, temperature_c, entered_at, exited_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
            "#,
            params![
                entry.entry_id,
                entry.buffer_id,
                entry.lot_id,
                entry.run_id,
                entry.quantity_kg,
                entry.temperature_c,
                format_ts(&entry.entered_at),
            ],
        )?;
        Ok(())
    }

    /// 关闭在库条目 (出库)
    pub fn close_entry_tx(
        conn: &Connection,
        entry_id: &str,
        exited_at: &DateTime<Utc>,
    ) -> RepositoryResult<usize> {
        let affected = conn.execute(
            "UPDATE buffer_entries SET exited_at = ?1 WHERE entry_id = ?2 AND exited_at IS NULL",
            params![format_ts(exited_at), entry_id],
        )?;
        Ok(affected)
    }

    /// 部分转出后更新剩余量
    pub fn update_entry_quantity_tx(
        conn: &Connection,
        entry_id: &str,
        quantity_kg: f64,
    ) -> RepositoryResult<usize> {
        let affected = conn.execute(
            "UPDATE buffer_entries SET quantity_kg = ?1 WHERE entry_id = ?2 AND exited_at IS NULL",
            params![quantity_kg, entry_id],
        )?;
        Ok(affected)
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_buffer(row: &Row) -> rusqlite::Result<Buffer> {
        let allowed_raw: String = row.get(3)?;
        let codes: Vec<String> = serde_json::from_str(&allowed_raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        let allowed_lot_types = codes
            .iter()
            .map(|c| {
                LotType::from_db_str(c).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        Type::Text,
                        format!("未知批次类型: {}", c).into(),
                    )
                })
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Buffer {
            buffer_id: row.get(0)?,
            buffer_code: row.get(1)?,
            buffer_type: row.get(2)?,
            allowed_lot_types,
            capacity_kg: row.get(4)?,
            temp_min_c: row.get(5)?,
            temp_max_c: row.get(6)?,
            is_active: row.get(7)?,
        })
    }

    fn map_entry(row: &Row) -> rusqlite::Result<BufferInventoryEntry> {
        let entered_at: String = row.get(6)?;
        Ok(BufferInventoryEntry {
            entry_id: row.get(0)?,
            buffer_id: row.get(1)?,
            lot_id: row.get(2)?,
            run_id: row.get(3)?,
            quantity_kg: row.get(4)?,
            temperature_c: row.get(5)?,
            entered_at: parse_ts(6, &entered_at)?,
            exited_at: parse_opt_ts(7, row.get(7)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_shared;

    #[test]
    fn test_seeded_buffers_decode() {
        let repo = BufferRepository::new(open_in_memory_shared().unwrap());
        let buffers = repo.list_all().unwrap();
        assert_eq!(buffers.len(), 5);

        let lk = buffers.iter().find(|b| b.buffer_code == "LK-001").unwrap();
        assert_eq!(
            lk.allowed_lot_types,
            vec![LotType::Deboned, LotType::BulkMix]
        );
        assert_eq!(lk.capacity_kg, 1000.0);
        assert_eq!(lk.temp_min_c, Some(1.0));

        let fg = buffers.iter().find(|b| b.buffer_code == "FG-001").unwrap();
        assert!(fg.temp_min_c.is_none());
        assert!(fg.is_active);
    }

    #[test]
    fn test_insert_custom_buffer() {
        let conn = open_in_memory_shared().unwrap();
        let c = conn.lock().unwrap();
        let buffer = Buffer {
            buffer_id: "TEST-1".to_string(),
            buffer_code: "TEST-1".to_string(),
            buffer_type: "LK".to_string(),
            allowed_lot_types: vec![LotType::Raw],
            capacity_kg: 10.0,
            temp_min_c: None,
            temp_max_c: None,
            is_active: false,
        };
        BufferRepository::insert_tx(&c, &buffer).unwrap();
        let found = BufferRepository::find_by_id_tx(&c, "TEST-1").unwrap().unwrap();
        assert_eq!(found, buffer);
        assert_eq!(BufferRepository::open_total_kg_tx(&c, "TEST-1").unwrap(), 0.0);
    }
}
