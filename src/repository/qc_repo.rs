// ==========================================
// 生产批次追溯引擎 - 质检关卡与结论仓储
// ==========================================
// 红线: qc_decisions 只追加; 最新结论按 decided_at 倒序、写入顺序兜底
// ==========================================

use crate::db::{lock_connection, SharedConnection, DEFAULT_BUSY_TIMEOUT_MS};
use crate::domain::qc::{QcDecision, QcGate};
use crate::domain::types::{Decision, GateType};
use crate::repository::error::RepositoryResult;
use crate::repository::row_codec::{format_ts, parse_enum, parse_ts};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;
use std::time::Duration;

const DECISION_COLUMNS: &str = "decision_id, lot_id, gate_id, operator_id, decision, notes, \
                                temperature_c, digital_signature, decided_at";

pub struct QcRepository {
    conn: SharedConnection,
    timeout: Duration,
}

impl QcRepository {
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
    // 关卡
    // ==========================================

    pub fn find_gate(&self, gate_id: &str) -> RepositoryResult<Option<QcGate>> {
        let conn = self.get_conn()?;
        Self::find_gate_tx(&conn, gate_id)
    }

    pub fn list_gates(&self) -> RepositoryResult<Vec<QcGate>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT gate_id, gate_code, name, gate_type, is_ccp FROM qc_gates ORDER BY gate_code",
        )?;
        let gates = stmt
            .query_map([], Self::map_gate)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(gates)
    }

    pub fn find_gate_tx(conn: &Connection, gate_id: &str) -> RepositoryResult<Option<QcGate>> {
        let gate = conn
            .query_row(
                "SELECT gate_id, gate_code, name, gate_type, is_ccp FROM qc_gates WHERE gate_id = ?1",
                params![gate_id],
                Self::map_gate,
            )
            .optional()?;
        Ok(gate)
    }

    pub fn insert_gate_tx(conn: &Connection, gate: &QcGate) -> RepositoryResult<()> {
        conn.execute(
            "INSERT INTO qc_gates (gate_id, gate_code, name, gate_type, is_ccp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                gate.gate_id,
                gate.gate_code,
                gate.name,
                gate.gate_type.to_db_str(),
                gate.is_ccp,
            ],
        )?;
        Ok(())
    }

    // ==========================================
    // 结论
    // ==========================================

    pub fn insert_decision_tx(conn: &Connection, decision: &QcDecision) -> RepositoryResult<()> {
        conn.execute(
            r#"
            INSERT INTO qc_decisions (
                decision_id, lot_id, gate_id, operator_id, decision, notes,
                temperature_c, digital_signature, decided_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                decision.decision_id,
                decision.lot_id,
                decision.gate_id,
                decision.operator_id,
                decision.decision.to_db_str(),
                decision.notes,
                decision.temperature_c,
                decision.digital_signature,
                format_ts(&decision.decided_at),
            ],
        )?;
        Ok(())
    }

    /// 某批次在某关卡的最新结论
    pub fn latest_decision_tx(
        conn: &Connection,
        lot_id: &str,
        gate_id: &str,
    ) -> RepositoryResult<Option<QcDecision>> {
        let sql = format!(
            "SELECT {} FROM qc_decisions WHERE lot_id = ?1 AND gate_id = ?2
             ORDER BY decided_at DESC, rowid DESC LIMIT 1",
            DECISION_COLUMNS
        );
        let decision = conn
            .query_row(&sql, params![lot_id, gate_id], Self::map_decision)
            .optional()?;
        Ok(decision)
    }

    pub fn latest_decision(
        &self,
        lot_id: &str,
        gate_id: &str,
    ) -> RepositoryResult<Option<QcDecision>> {
        let conn = self.get_conn()?;
        Self::latest_decision_tx(&conn, lot_id, gate_id)
    }

    /// 某批次的全部结论历史 (时间正序)
    pub fn history_for_lot(&self, lot_id: &str) -> RepositoryResult<Vec<QcDecision>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM qc_decisions WHERE lot_id = ?1 ORDER BY decided_at, rowid",
            DECISION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let decisions = stmt
            .query_map(params![lot_id], Self::map_decision)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decisions)
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_gate(row: &Row) -> rusqlite::Result<QcGate> {
        let gate_type: String = row.get(3)?;
        Ok(QcGate {
            gate_id: row.get(0)?,
            gate_code: row.get(1)?,
            name: row.get(2)?,
            gate_type: parse_enum(3, &gate_type, GateType::from_db_str)?,
            is_ccp: row.get(4)?,
        })
    }

    fn map_decision(row: &Row) -> rusqlite::Result<QcDecision> {
        let decision: String = row.get(4)?;
        let decided_at: String = row.get(8)?;
        Ok(QcDecision {
            decision_id: row.get(0)?,
            lot_id: row.get(1)?,
            gate_id: row.get(2)?,
            operator_id: row.get(3)?,
            decision: parse_enum(4, &decision, Decision::from_db_str)?,
            notes: row.get(5)?,
            temperature_c: row.get(6)?,
            digital_signature: row.get(7)?,
            decided_at: parse_ts(8, &decided_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_shared;
    use crate::domain::lot::Lot;
    use crate::domain::types::LotType;
    use crate::repository::lot_repo::LotRepository;
    use chrono::{Duration as ChronoDuration, Utc};

    fn decision(id: &str, kind: Decision, at: chrono::DateTime<Utc>) -> QcDecision {
        QcDecision {
            decision_id: id.to_string(),
            lot_id: "L1".to_string(),
            gate_id: "gate-receipt".to_string(),
            operator_id: "qa-1".to_string(),
            decision: kind,
            notes: None,
            temperature_c: Some(2.5),
            digital_signature: None,
            decided_at: at,
        }
    }

    #[test]
    fn test_latest_decision_keeps_history() {
        let conn = open_in_memory_shared().unwrap();
        let repo = QcRepository::new(conn.clone());
        {
            let c = conn.lock().unwrap();
            LotRepository::insert_tx(
                &c,
                &Lot {
                    lot_id: "L1".to_string(),
                    lot_code: "RAW-1".to_string(),
                    lot_type: LotType::Raw,
                    run_id: None,
                    step_index: None,
                    weight_kg: None,
                    temperature_c: None,
                    metadata: serde_json::json!({}),
                    operator_id: None,
                    created_at: Utc::now(),
                },
            )
            .unwrap();

            let t0 = Utc::now();
            QcRepository::insert_decision_tx(&c, &decision("D1", Decision::Fail, t0)).unwrap();
            QcRepository::insert_decision_tx(
                &c,
                &decision("D2", Decision::Pass, t0 + ChronoDuration::milliseconds(1)),
            )
            .unwrap();
        }

        let latest = repo.latest_decision("L1", "gate-receipt").unwrap().unwrap();
        assert_eq!(latest.decision_id, "D2");
        assert_eq!(repo.history_for_lot("L1").unwrap().len(), 2);
        assert!(repo.latest_decision("L1", "gate-mixing").unwrap().is_none());
    }

    #[test]
    fn test_seeded_gates() {
        let repo = QcRepository::new(open_in_memory_shared().unwrap());
        let gates = repo.list_gates().unwrap();
        assert_eq!(gates.len(), 4);
        assert!(repo.find_gate("gate-freezing").unwrap().unwrap().is_blocking());
        assert!(!repo.find_gate("gate-mixing").unwrap().unwrap().is_blocking());
    }
}
