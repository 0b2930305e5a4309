// ==========================================
// 生产批次追溯引擎 - 生产运行数据仓储
// ==========================================
// 覆盖表: production_runs / run_step_executions / run_events
// 并发: production_runs.revision 乐观锁
// 幂等: production_runs.idempotency_key UNIQUE
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::run::{ProductionRun, RunAction, RunEvent, RunStepExecution};
use crate::domain::types::{RunStatus, StepExecutionStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_codec::{
    format_opt_ts, format_ts, parse_code_sequence, parse_enum, parse_opt_ts, parse_ts,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;
use std::time::Duration;

const RUN_COLUMNS: &str = "run_id, run_code, flow_version_id, status, current_step_index, \
                           idempotency_key, daily_target_kg, created_by, created_at, started_at, \
                           completed_at, ended_at, hold_reason, abort_reason, revision";

const STEP_COLUMNS: &str = "execution_id, run_id, step_index, node_id, status, started_at, \
                            completed_at, operator_id, notes";

const EVENT_COLUMNS: &str = "event_id, run_id, action, from_status, to_status, step_index, \
                             actor, detail, occurred_at";

// ==========================================
// RunRepository - 生产运行仓储
// ==========================================
pub struct RunRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl RunRepository {
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
    // 查询操作
    // ==========================================

    pub fn find_by_id(&self, run_id: &str) -> RepositoryResult<Option<ProductionRun>> {
        let conn = self.get_conn()?;
        Self::find_by_id_tx(&conn, run_id)
    }

    /// 按状态过滤列出运行 (最新创建在前)
    pub fn list(&self, status: Option<RunStatus>) -> RepositoryResult<Vec<ProductionRun>> {
        let conn = self.get_conn()?;
        let runs = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM production_runs WHERE status = ?1 ORDER BY created_at DESC, rowid DESC",
                    RUN_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![status.to_db_str()], Self::map_run)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM production_runs ORDER BY created_at DESC, rowid DESC",
                    RUN_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Self::map_run)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(runs)
    }

    pub fn list_steps(&self, run_id: &str) -> RepositoryResult<Vec<RunStepExecution>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM run_step_executions WHERE run_id = ?1 ORDER BY step_index",
            STEP_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let steps = stmt
            .query_map(params![run_id], Self::map_step)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    pub fn list_events(&self, run_id: &str) -> RepositoryResult<Vec<RunEvent>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM run_events WHERE run_id = ?1 ORDER BY occurred_at, rowid",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![run_id], Self::map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn find_by_id_tx(conn: &Connection, run_id: &str) -> RepositoryResult<Option<ProductionRun>> {
        let sql = format!("SELECT {} FROM production_runs WHERE run_id = ?1", RUN_COLUMNS);
        let run = conn
            .query_row(&sql, params![run_id], Self::map_run)
            .optional()?;
        Ok(run)
    }

    pub fn find_by_idempotency_key_tx(
        conn: &Connection,
        idempotency_key: &str,
    ) -> RepositoryResult<Option<ProductionRun>> {
        let sql = format!(
            "SELECT {} FROM production_runs WHERE idempotency_key = ?1",
            RUN_COLUMNS
        );
        let run = conn
            .query_row(&sql, params![idempotency_key], Self::map_run)
            .optional()?;
        Ok(run)
    }

    /// 某前缀下运行编码的最大流水号 (编码按日重置)
    pub fn max_code_sequence_tx(conn: &Connection, code_prefix: &str) -> RepositoryResult<u32> {
        let pattern = format!("{}%", code_prefix);
        let mut stmt = conn.prepare("SELECT run_code FROM production_runs WHERE run_code LIKE ?1")?;
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

    pub fn insert_tx(conn: &Connection, run: &ProductionRun) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO production_runs (
                run_id, run_code, flow_version_id, status, current_step_index,
                idempotency_key, daily_target_kg, created_by, created_at, started_at,
                completed_at, ended_at, hold_reason, abort_reason, revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                run.run_id,
                run.run_code,
                run.flow_version_id,
                run.status.to_db_str(),
                run.current_step_index,
                run.idempotency_key,
                run.daily_target_kg,
                run.created_by,
                format_ts(&run.created_at),
                format_opt_ts(&run.started_at),
                format_opt_ts(&run.completed_at),
                format_opt_ts(&run.ended_at),
                run.hold_reason,
                run.abort_reason,
                run.revision,
            ],
        )?;
        Ok(())
    }

    /// 更新运行状态字段 (乐观锁)
    ///
    /// # 参数
    /// - run: 更新后的运行实体,其 revision 为读取时的版本号
    ///
    /// # 返回
    /// - Ok(new_revision)
    /// - Err(OptimisticLockFailure): 读取之后已被其他调用方修改
    /// - Err(NotFound): 运行不存在
    pub fn update_state_tx(conn: &Connection, run: &ProductionRun) -> RepositoryResult<i32> {
        let affected = conn.execute(
            r#"
            UPDATE production_runs SET
                status = ?1,
                current_step_index = ?2,
                started_at = ?3,
                completed_at = ?4,
                ended_at = ?5,
                hold_reason = ?6,
                abort_reason = ?7,
                revision = revision + 1
            WHERE run_id = ?8 AND revision = ?9
            "#,
            params![
                run.status.to_db_str(),
                run.current_step_index,
                format_opt_ts(&run.started_at),
                format_opt_ts(&run.completed_at),
                format_opt_ts(&run.ended_at),
                run.hold_reason,
                run.abort_reason,
                run.run_id,
                run.revision,
            ],
        )?;

        if affected == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM production_runs WHERE run_id = ?1",
                    params![run.run_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(RepositoryError::not_found("ProductionRun", &run.run_id));
            }
            return Err(RepositoryError::OptimisticLockFailure {
                entity: "ProductionRun".to_string(),
                id: run.run_id.clone(),
                expected: run.revision,
            });
        }

        Ok(run.revision + 1)
    }

    // ==========================================
    // 工序执行记录
    // ==========================================

    pub fn find_step_tx(
        conn: &Connection,
        run_id: &str,
        step_index: i32,
    ) -> RepositoryResult<Option<RunStepExecution>> {
        let sql = format!(
            "SELECT {} FROM run_step_executions WHERE run_id = ?1 AND step_index = ?2",
            STEP_COLUMNS
        );
        let step = conn
            .query_row(&sql, params![run_id, step_index], Self::map_step)
            .optional()?;
        Ok(step)
    }

    pub fn insert_step_tx(conn: &Connection, step: &RunStepExecution) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO run_step_executions (
                execution_id, run_id, step_index, node_id, status,
                started_at, completed_at, operator_id, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                step.execution_id,
                step.run_id,
                step.step_index,
                step.node_id,
                step.status.to_db_str(),
                format_opt_ts(&step.started_at),
                format_opt_ts(&step.completed_at),
                step.operator_id,
                step.notes,
            ],
        )?;
        Ok(())
    }

    pub fn update_step_tx(conn: &Connection, step: &RunStepExecution) -> RepositoryResult<()> {
        let affected = conn.execute(
            r#"
            UPDATE run_step_executions SET
                status = ?1, started_at = ?2, completed_at = ?3, operator_id = ?4, notes = ?5
            WHERE execution_id = ?6
            "#,
            params![
                step.status.to_db_str(),
                format_opt_ts(&step.started_at),
                format_opt_ts(&step.completed_at),
                step.operator_id,
                step.notes,
                step.execution_id,
            ],
        )?;
        if affected == 0 {
            return Err(RepositoryError::not_found(
                "RunStepExecution",
                &step.execution_id,
            ));
        }
        Ok(())
    }

    // ==========================================
    // 审计事件
    // ==========================================

    pub fn insert_event_tx(conn: &Connection, event: &RunEvent) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO run_events (
                event_id, run_id, action, from_status, to_status,
                step_index, actor, detail, occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event.event_id,
                event.run_id,
                event.action.to_db_str(),
                event.from_status.map(|s| s.to_db_str()),
                event.to_status.to_db_str(),
                event.step_index,
                event.actor,
                event.detail,
                format_ts(&event.occurred_at),
            ],
        )?;
        Ok(())
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_run(row: &Row) -> rusqlite::Result<ProductionRun> {
        let status: String = row.get(3)?;
        let created_at: String = row.get(8)?;
        Ok(ProductionRun {
            run_id: row.get(0)?,
            run_code: row.get(1)?,
            flow_version_id: row.get(2)?,
            status: parse_enum(3, &status, RunStatus::from_db_str)?,
            current_step_index: row.get(4)?,
            idempotency_key: row.get(5)?,
            daily_target_kg: row.get(6)?,
            created_by: row.get(7)?,
            created_at: parse_ts(8, &created_at)?,
            started_at: parse_opt_ts(9, row.get(9)?)?,
            completed_at: parse_opt_ts(10, row.get(10)?)?,
            ended_at: parse_opt_ts(11, row.get(11)?)?,
            hold_reason: row.get(12)?,
            abort_reason: row.get(13)?,
            revision: row.get(14)?,
        })
    }

    fn map_step(row: &Row) -> rusqlite::Result<RunStepExecution> {
        let status: String = row.get(4)?;
        Ok(RunStepExecution {
            execution_id: row.get(0)?,
            run_id: row.get(1)?,
            step_index: row.get(2)?,
            node_id: row.get(3)?,
            status: parse_enum(4, &status, StepExecutionStatus::from_db_str)?,
            started_at: parse_opt_ts(5, row.get(5)?)?,
            completed_at: parse_opt_ts(6, row.get(6)?)?,
            operator_id: row.get(7)?,
            notes: row.get(8)?,
        })
    }

    fn map_event(row: &Row) -> rusqlite::Result<RunEvent> {
        let action: String = row.get(2)?;
        let from_status: Option<String> = row.get(3)?;
        let to_status: String = row.get(4)?;
        let occurred_at: String = row.get(8)?;
        Ok(RunEvent {
            event_id: row.get(0)?,
            run_id: row.get(1)?,
            action: parse_enum(2, &action, RunAction::from_db_str)?,
            from_status: from_status
                .map(|s| parse_enum(3, &s, RunStatus::from_db_str))
                .transpose()?,
            to_status: parse_enum(4, &to_status, RunStatus::from_db_str)?,
            step_index: row.get(5)?,
            actor: row.get(6)?,
            detail: row.get(7)?,
            occurred_at: parse_ts(8, &occurred_at)?,
        })
    }
}
