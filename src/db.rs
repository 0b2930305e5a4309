// ==========================================
// 生产批次追溯引擎 - SQLite 连接与事务基础设施
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 所有变更入口走同一个 BEGIN IMMEDIATE 事务入口,带超时
// - 建表幂等,并写入标准流程/关卡/缓冲区种子数据
// ==========================================

use crate::domain::flow::CANONICAL_FLOW_STEPS;
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// 全局共享连接
pub type SharedConnection = Arc<Mutex<Connection>>;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 标准流程版本 ID (种子数据)
pub const CANONICAL_FLOW_VERSION_ID: &str = "flow-skewer-v1";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开连接、建表并包装为共享连接
pub fn open_shared(db_path: &str) -> rusqlite::Result<SharedConnection> {
    let conn = open_sqlite_connection(db_path)?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 内存库 (测试用)
pub fn open_in_memory_shared() -> rusqlite::Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    configure_sqlite_connection(&conn)?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

// ==========================================
// 连接获取与事务
// ==========================================

/// 在超时时间内获取连接锁
///
/// # 返回
/// - Err(StorageUnavailable): 超时
///
/// 持锁线程 panic 后锁会中毒: 回滚其遗留的未完成事务,清除中毒标记后继续使用
pub fn lock_connection(
    conn: &SharedConnection,
    timeout: Duration,
) -> RepositoryResult<MutexGuard<'_, Connection>> {
    let deadline = Instant::now() + timeout;
    loop {
        match conn.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(e)) => {
                let guard = e.into_inner();
                if !guard.is_autocommit() {
                    guard.execute_batch("ROLLBACK")?;
                }
                conn.clear_poison();
                warn!("数据库连接锁曾中毒,已回滚未完成事务并恢复");
                return Ok(guard);
            }
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(RepositoryError::StorageUnavailable(format!(
                        "获取数据库连接超时 ({}ms)",
                        timeout.as_millis()
                    )));
                }
                thread::sleep(LOCK_POLL_INTERVAL);
            }
        }
    }
}

/// 在单个 BEGIN IMMEDIATE 事务中执行写操作
///
/// 闭包返回 Ok 时提交,返回 Err 时回滚(事务 drop 即回滚)
pub fn with_write_tx<T, E, F>(conn: &SharedConnection, timeout: Duration, f: F) -> Result<T, E>
where
    E: From<RepositoryError>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    let mut guard = lock_connection(conn, timeout)?;
    let tx = guard
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(RepositoryError::from)?;

    let value = f(&tx)?;
    tx.commit().map_err(RepositoryError::from)?;
    Ok(value)
}

/// 只读访问 (同样受超时约束)
pub fn with_read<T, E, F>(conn: &SharedConnection, timeout: Duration, f: F) -> Result<T, E>
where
    E: From<RepositoryError>,
    F: FnOnce(&Connection) -> Result<T, E>,
{
    let guard = lock_connection(conn, timeout)?;
    f(&guard)
}

// ==========================================
// Schema
// ==========================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS qc_gates (
    gate_id TEXT PRIMARY KEY,
    gate_code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    gate_type TEXT NOT NULL,
    is_ccp INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS flow_versions (
    flow_version_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flow_steps (
    flow_version_id TEXT NOT NULL REFERENCES flow_versions(flow_version_id),
    step_index INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    name TEXT NOT NULL,
    qc_gate_id TEXT REFERENCES qc_gates(gate_id),
    PRIMARY KEY (flow_version_id, step_index)
);

CREATE TABLE IF NOT EXISTS production_runs (
    run_id TEXT PRIMARY KEY,
    run_code TEXT NOT NULL UNIQUE,
    flow_version_id TEXT NOT NULL REFERENCES flow_versions(flow_version_id),
    status TEXT NOT NULL,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL UNIQUE,
    daily_target_kg REAL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    ended_at TEXT,
    hold_reason TEXT,
    abort_reason TEXT,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON production_runs(status);

CREATE TABLE IF NOT EXISTS run_step_executions (
    execution_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES production_runs(run_id),
    step_index INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    operator_id TEXT,
    notes TEXT,
    UNIQUE (run_id, step_index)
);

CREATE TABLE IF NOT EXISTS run_events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES production_runs(run_id),
    action TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    actor TEXT NOT NULL,
    detail TEXT,
    occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, occurred_at);

CREATE TABLE IF NOT EXISTS lots (
    lot_id TEXT PRIMARY KEY,
    lot_code TEXT NOT NULL UNIQUE,
    lot_type TEXT NOT NULL,
    run_id TEXT REFERENCES production_runs(run_id),
    step_index INTEGER,
    weight_kg REAL,
    temperature_c REAL,
    metadata TEXT NOT NULL DEFAULT '{}',
    operator_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lots_run_step ON lots(run_id, step_index);

CREATE TABLE IF NOT EXISTS lot_genealogy (
    link_id TEXT PRIMARY KEY,
    parent_lot_id TEXT NOT NULL REFERENCES lots(lot_id),
    child_lot_id TEXT NOT NULL REFERENCES lots(lot_id),
    quantity_used_kg REAL,
    linked_at TEXT NOT NULL,
    UNIQUE (parent_lot_id, child_lot_id),
    CHECK (parent_lot_id <> child_lot_id)
);

CREATE INDEX IF NOT EXISTS idx_genealogy_parent ON lot_genealogy(parent_lot_id);
CREATE INDEX IF NOT EXISTS idx_genealogy_child ON lot_genealogy(child_lot_id);

CREATE TABLE IF NOT EXISTS qc_decisions (
    decision_id TEXT PRIMARY KEY,
    lot_id TEXT NOT NULL REFERENCES lots(lot_id),
    gate_id TEXT NOT NULL REFERENCES qc_gates(gate_id),
    operator_id TEXT NOT NULL,
    decision TEXT NOT NULL,
    notes TEXT,
    temperature_c REAL,
    digital_signature TEXT,
    decided_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_qc_decisions_lot_gate ON qc_decisions(lot_id, gate_id, decided_at);

CREATE TABLE IF NOT EXISTS buffers (
    buffer_id TEXT PRIMARY KEY,
    buffer_code TEXT NOT NULL UNIQUE,
    buffer_type TEXT NOT NULL,
    allowed_lot_types TEXT NOT NULL,
    capacity_kg REAL NOT NULL,
    temp_min_c REAL,
    temp_max_c REAL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS buffer_entries (
    entry_id TEXT PRIMARY KEY,
    buffer_id TEXT NOT NULL REFERENCES buffers(buffer_id),
    lot_id TEXT NOT NULL REFERENCES lots(lot_id),
    run_id TEXT REFERENCES production_runs(run_id),
    quantity_kg REAL NOT NULL,
    temperature_c REAL,
    entered_at TEXT NOT NULL,
    exited_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_buffer_entries_active ON buffer_entries(buffer_id, exited_at);
CREATE UNIQUE INDEX IF NOT EXISTS uq_buffer_entries_open
    ON buffer_entries(buffer_id, lot_id) WHERE exited_at IS NULL;

CREATE TABLE IF NOT EXISTS temperature_logs (
    log_id TEXT PRIMARY KEY,
    measurement_type TEXT NOT NULL,
    temperature_c REAL NOT NULL,
    lot_id TEXT REFERENCES lots(lot_id),
    buffer_id TEXT REFERENCES buffers(buffer_id),
    is_violation INTEGER NOT NULL,
    recorded_by TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_temperature_logs_lot ON temperature_logs(lot_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_temperature_logs_buffer ON temperature_logs(buffer_id, recorded_at);
"#;

/// 建表 (幂等) 并写入种子数据
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![CURRENT_SCHEMA_VERSION, now],
    )?;

    seed_defaults(conn, &now)?;
    Ok(())
}

// (gate_id, gate_code, 名称, 类型, 是否CCP, 绑定工序)
const DEFAULT_GATES: [(&str, &str, &str, &str, bool, i32); 4] = [
    ("gate-receipt", "QC-RCV", "原料接收温度检查", "BLOCKING", true, 1),
    ("gate-mixing", "QC-MIX", "混料配比复核", "CHECKPOINT", false, 4),
    ("gate-freezing", "QC-FRZ", "速冻中心温度检查", "BLOCKING", true, 6),
    ("gate-shipment", "QC-SHP", "发货放行", "BLOCKING", false, 10),
];

// (buffer_code, 类型, 允许批次类型, 容量, 最低温, 最高温)
const DEFAULT_BUFFERS: [(&str, &str, &str, f64, Option<f64>, Option<f64>); 5] = [
    ("LK-001", "LK", r#"["DEB","BULK"]"#, 1000.0, Some(1.0), Some(4.0)),
    ("MIX-001", "MIX", r#"["MIX"]"#, 500.0, Some(2.0), Some(4.0)),
    ("SKW-001", "SKW", r#"["SKW"]"#, 300.0, Some(2.0), Some(4.0)),
    ("FRZ-001", "FRZ", r#"["FRZ"]"#, 800.0, Some(-25.0), Some(-18.0)),
    ("FG-001", "PAL", r#"["FG"]"#, 2000.0, None, None),
];

fn seed_defaults(conn: &Connection, now: &str) -> rusqlite::Result<()> {
    for (gate_id, code, name, gate_type, is_ccp, _) in DEFAULT_GATES.iter() {
        conn.execute(
            "INSERT OR IGNORE INTO qc_gates (gate_id, gate_code, name, gate_type, is_ccp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![gate_id, code, name, gate_type, is_ccp],
        )?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO flow_versions (flow_version_id, name, status, created_at)
         VALUES (?1, ?2, 'PUBLISHED', ?3)",
        params![CANONICAL_FLOW_VERSION_ID, "串制品标准流程 v1", now],
    )?;

    for (index, (node_id, name)) in CANONICAL_FLOW_STEPS.iter().enumerate() {
        let index = index as i32;
        let gate_id = DEFAULT_GATES
            .iter()
            .find(|g| g.5 == index)
            .map(|g| g.0);
        conn.execute(
            "INSERT OR IGNORE INTO flow_steps (flow_version_id, step_index, node_id, name, qc_gate_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![CANONICAL_FLOW_VERSION_ID, index, node_id, name, gate_id],
        )?;
    }

    for (code, buffer_type, allowed, capacity, tmin, tmax) in DEFAULT_BUFFERS.iter() {
        conn.execute(
            "INSERT OR IGNORE INTO buffers
                (buffer_id, buffer_code, buffer_type, allowed_lot_types, capacity_kg, temp_min_c, temp_max_c, is_active)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![code, buffer_type, allowed, capacity, tmin, tmax],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM flow_steps WHERE flow_version_id = ?1",
                [CANONICAL_FLOW_VERSION_ID],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, 11);

        let buffers: i64 = conn
            .query_row("SELECT COUNT(*) FROM buffers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(buffers, 5);

        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_lock_timeout_surfaces_storage_unavailable() {
        let shared = open_in_memory_shared().unwrap();
        let _held = shared.lock().unwrap();

        let result = lock_connection(&shared, Duration::from_millis(20));
        assert!(matches!(result, Err(RepositoryError::StorageUnavailable(_))));
    }

    #[test]
    fn test_poisoned_lock_recovers_and_rolls_back() {
        let shared = open_in_memory_shared().unwrap();

        let worker = shared.clone();
        let joined = thread::spawn(move || {
            let guard = worker.lock().unwrap();
            guard.execute_batch("BEGIN IMMEDIATE").unwrap();
            guard
                .execute(
                    "INSERT INTO config_kv (scope_id, key, value, updated_at) VALUES ('global', 'k', 'v', 'now')",
                    [],
                )
                .unwrap();
            panic!("持锁期间崩溃");
        })
        .join();
        assert!(joined.is_err());
        assert!(shared.is_poisoned());

        let guard = lock_connection(&shared, Duration::from_millis(100)).unwrap();
        assert!(guard.is_autocommit());
        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM config_kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        drop(guard);
        assert!(!shared.is_poisoned());
    }

    #[test]
    fn test_write_tx_rolls_back_on_error() {
        let shared = open_in_memory_shared().unwrap();

        let result: Result<(), RepositoryError> =
            with_write_tx(&shared, Duration::from_secs(1), |tx| {
                tx.execute(
                    "INSERT INTO config_kv (scope_id, key, value, updated_at) VALUES ('global', 'k', 'v', 'now')",
                    [],
                )?;
                Err(RepositoryError::ValidationError("abort".to_string()))
            });
        assert!(result.is_err());

        let count: i64 = shared
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM config_kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
