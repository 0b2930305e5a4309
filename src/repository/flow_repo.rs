// ==========================================
// 生产批次追溯引擎 - 工艺流程版本仓储
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::flow::{FlowStep, FlowVersion};
use crate::domain::types::FlowVersionStatus;
use crate::repository::error::RepositoryResult;
use crate::repository::row_codec::{format_ts, parse_enum, parse_ts};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::MutexGuard;
use std::time::Duration;

pub struct FlowRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl FlowRepository {
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

    pub fn find_by_id(&self, flow_version_id: &str) -> RepositoryResult<Option<FlowVersion>> {
        let conn = self.get_conn()?;
        Self::find_by_id_tx(&conn, flow_version_id)
    }

    /// 查询流程版本及其全部工序 (按序号升序)
    pub fn find_by_id_tx(
        conn: &Connection,
        flow_version_id: &str,
    ) -> RepositoryResult<Option<FlowVersion>> {
        let header = conn
            .query_row(
                "SELECT flow_version_id, name, status, created_at FROM flow_versions WHERE flow_version_id = ?1",
                params![flow_version_id],
                |row| {
                    let status: String = row.get(2)?;
                    let created_at: String = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        parse_enum(2, &status, FlowVersionStatus::from_db_str)?,
                        parse_ts(3, &created_at)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, status, created_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT step_index, node_id, name, qc_gate_id FROM flow_steps
             WHERE flow_version_id = ?1 ORDER BY step_index",
        )?;
        let steps = stmt
            .query_map(params![id], |row| {
                Ok(FlowStep {
                    index: row.get(0)?,
                    node_id: row.get(1)?,
                    name: row.get(2)?,
                    qc_gate_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(FlowVersion {
            flow_version_id: id,
            name,
            status,
            steps,
            created_at,
        }))
    }

    /// 写入流程版本及其工序
    pub fn insert_tx(conn: &Connection, flow: &FlowVersion) -> RepositoryResult<()> {
        conn.execute(
            "INSERT INTO flow_versions (flow_version_id, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                flow.flow_version_id,
                flow.name,
                flow.status.to_db_str(),
                format_ts(&flow.created_at),
            ],
        )?;

        let mut stmt = conn.prepare(
            "INSERT INTO flow_steps (flow_version_id, step_index, node_id, name, qc_gate_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for step in &flow.steps {
            stmt.execute(params![
                flow.flow_version_id,
                step.index,
                step.node_id,
                step.name,
                step.qc_gate_id,
            ])?;
        }
        Ok(())
    }

    pub fn insert(&self, flow: &FlowVersion) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        Self::insert_tx(&tx, flow)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory_shared, CANONICAL_FLOW_VERSION_ID};

    #[test]
    fn test_seeded_canonical_flow() {
        let repo = FlowRepository::new(open_in_memory_shared().unwrap());
        let flow = repo.find_by_id(CANONICAL_FLOW_VERSION_ID).unwrap().unwrap();

        assert!(flow.is_published());
        assert_eq!(flow.steps.len(), 11);
        assert_eq!(flow.final_step_index(), Some(10));
        assert_eq!(flow.steps[0].node_id, "start");
        assert_eq!(flow.steps[5].node_id, "step-5");
        assert_eq!(flow.steps[1].qc_gate_id.as_deref(), Some("gate-receipt"));
        assert!(repo.find_by_id("nope").unwrap().is_none());
    }
}
