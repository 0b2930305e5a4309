// ==========================================
// 生产批次追溯引擎 - 批次与谱系数据仓储
// ==========================================
// 红线: Repository 不做业务逻辑,只做数据映射
// 红线: 批次与谱系关系只追加,不提供删除/修改
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::lot::{GenealogyLink, Lot};
use crate::domain::types::LotType;
use crate::repository::error::RepositoryResult;
use crate::repository::row_codec::{format_ts, parse_code_sequence, parse_enum, parse_json, parse_ts};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;
use std::time::Duration;

const LOT_COLUMNS: &str = "lot_id, lot_code, lot_type, run_id, step_index, weight_kg, \
                           temperature_c, metadata, operator_id, created_at";

const LINK_COLUMNS: &str = "link_id, parent_lot_id, child_lot_id, quantity_used_kg, linked_at";

// ==========================================
// LotRepository - 批次仓储
// ==========================================
pub struct LotRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl LotRepository {
    /// 创建新的批次仓储
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

    /// 获取数据库连接
    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn, self.timeout)
    }

    // ==========================================
    // 查询操作
    // ==========================================

    pub fn find_by_id(&self, lot_id: &str) -> RepositoryResult<Option<Lot>> {
        let conn = self.get_conn()?;
        Self::find_by_id_tx(&conn, lot_id)
    }

    pub fn find_by_code(&self, lot_code: &str) -> RepositoryResult<Option<Lot>> {
        let conn = self.get_conn()?;
        Self::find_by_code_tx(&conn, lot_code)
    }

    /// 按创建时间倒序列出批次
    pub fn list_recent(&self, limit: usize) -> RepositoryResult<Vec<Lot>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM lots ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            LOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let lots = stmt
            .query_map(params![limit as i64], Self::map_lot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lots)
    }

    pub fn find_by_id_tx(conn: &Connection, lot_id: &str) -> RepositoryResult<Option<Lot>> {
        let sql = format!("SELECT {} FROM lots WHERE lot_id = ?1", LOT_COLUMNS);
        let lot = conn
            .query_row(&sql, params![lot_id], Self::map_lot)
            .optional()?;
        Ok(lot)
    }

    pub fn find_by_code_tx(conn: &Connection, lot_code: &str) -> RepositoryResult<Option<Lot>> {
        let sql = format!("SELECT {} FROM lots WHERE lot_code = ?1", LOT_COLUMNS);
        let lot = conn
            .query_row(&sql, params![lot_code], Self::map_lot)
            .optional()?;
        Ok(lot)
    }

    /// 查询某运行某工序下登记的批次
    pub fn find_by_run_step_tx(
        conn: &Connection,
        run_id: &str,
        step_index: i32,
    ) -> RepositoryResult<Vec<Lot>> {
        let sql = format!(
            "SELECT {} FROM lots WHERE run_id = ?1 AND step_index = ?2 ORDER BY created_at, rowid",
            LOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let lots = stmt
            .query_map(params![run_id, step_index], Self::map_lot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lots)
    }

    /// 当日某类型批次编码的最大流水号
    pub fn max_code_sequence_tx(conn: &Connection, code_prefix: &str) -> RepositoryResult<u32> {
        let pattern = format!("{}%", code_prefix);
        let mut stmt = conn.prepare("SELECT lot_code FROM lots WHERE lot_code LIKE ?1")?;
        let codes = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(codes
            .iter()
            .filter_map(|c| parse_code_sequence(c, code_prefix))
            .max()
            .unwrap_or(0))
    }

    // ==========================================
    // 写入操作
    // ==========================================

    pub fn insert_tx(conn: &Connection, lot: &Lot) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO lots (
                lot_id, lot_code, lot_type, run_id, step_index, weight_kg,
                temperature_c, metadata, operator_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                lot.lot_id,
                lot.lot_code,
                lot.lot_type.to_db_str(),
                lot.run_id,
                lot.step_index,
                lot.weight_kg,
                lot.temperature_c,
                lot.metadata.to_string(),
                lot.operator_id,
                format_ts(&lot.created_at),
            ],
        )?;
        Ok(())
    }

    // ==========================================
    // 谱系关系
    // ==========================================

    pub fn insert_link_tx(conn: &Connection, link: &GenealogyLink) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO lot_genealogy (
                link_id, parent_lot_id, child_lot_id, quantity_used_kg, linked_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                link.link_id,
                link.parent_lot_id,
                link.child_lot_id,
                link.quantity_used_kg,
                format_ts(&link.linked_at),
            ],
        )?;
        Ok(())
    }

    /// 以 child 为终点的边 (父批次方向)
    pub fn links_to_child_tx(
        conn: &Connection,
        child_lot_id: &str,
    ) -> RepositoryResult<Vec<GenealogyLink>> {
        let sql = format!(
            "SELECT {} FROM lot_genealogy WHERE child_lot_id = ?1 ORDER BY linked_at, rowid",
            LINK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let links = stmt
            .query_map(params![child_lot_id], Self::map_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// 以 parent 为起点的边 (子批次方向)
    pub fn links_from_parent_tx(
        conn: &Connection,
        parent_lot_id: &str,
    ) -> RepositoryResult<Vec<GenealogyLink>> {
        let sql = format!(
            "SELECT {} FROM lot_genealogy WHERE parent_lot_id = ?1 ORDER BY linked_at, rowid",
            LINK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let links = stmt
            .query_map(params![parent_lot_id], Self::map_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_lot(row: &Row) -> rusqlite::Result<Lot> {
        let lot_type: String = row.get(2)?;
        let metadata: String = row.get(7)?;
        let created_at: String = row.get(9)?;
        Ok(Lot {
            lot_id: row.get(0)?,
            lot_code: row.get(1)?,
            lot_type: parse_enum(2, &lot_type, LotType::from_db_str)?,
            run_id: row.get(3)?,
            step_index: row.get(4)?,
            weight_kg: row.get(5)?,
            temperature_c: row.get(6)?,
            metadata: parse_json(7, &metadata)?,
            operator_id: row.get(8)?,
            created_at: parse_ts(9, &created_at)?,
        })
    }

    fn map_link(row: &Row) -> rusqlite::Result<GenealogyLink> {
        let linked_at: String = row.get(4)?;
        Ok(GenealogyLink {
            link_id: row.get(0)?,
            parent_lot_id: row.get(1)?,
            child_lot_id: row.get(2)?,
            quantity_used_kg: row.get(3)?,
            linked_at: parse_ts(4, &linked_at)?,
        })
    }
}
