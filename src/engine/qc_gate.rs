// ==========================================
// 生产批次追溯引擎 - 质检关卡引擎
// ==========================================
// 职责: 记录质检结论 + 判定工序关卡是否放行
// 红线: HOLD / FAIL 必须附带说明; 结论只追加不覆盖
// 红线: 只有 BLOCKING 关卡可以阻断工序推进
// ==========================================

use crate::config::EngineSettings;
use crate::db::{with_read, with_write_tx};
use crate::domain::flow::FlowStep;
use crate::domain::qc::{NewQcDecision, QcDecision, QcGate};
use crate::domain::types::Decision;
use crate::engine::accountability::{optional_text, require_text};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{LotRepository, QcRepository};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

/// 质检说明最大长度
pub const MAX_DECISION_NOTES_LEN: usize = 1000;

/// 复核温度允许范围 (°C)
pub const VERIFIED_TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);

// ==========================================
// GateOutcome - 关卡判定结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// 无关卡或非阻断关卡,或全部批次最新结论为 PASS
    Open,
    /// 阻断
    Blocked { gate_code: String, reason: String },
}

// ==========================================
// QcGateEngine - 质检关卡引擎
// ==========================================
pub struct QcGateEngine {
    repos: TraceRepositories,
    settings: EngineSettings,
}

impl QcGateEngine {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self { repos, settings }
    }

    // ==========================================
    // 写入
    // ==========================================

    /// 记录质检结论
    ///
    /// # 参数
    /// - input: 结论内容
    /// - operator_id: 质检员
    /// - now: 结论时间
    ///
    /// # 返回
    /// - Ok(QcDecision): 新追加的结论
    /// - Err(Validation): 说明缺失/过短、温度越界
    /// - Err(NotFound): 批次或关卡不存在
    pub fn record_decision(
        &self,
        input: NewQcDecision,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<QcDecision> {
        if operator_id.trim().is_empty() {
            return Err(EngineError::validation("operator_id", "质检员不能为空"));
        }

        let notes = if input.decision.requires_notes() {
            Some(require_text(
                "notes",
                input.notes.as_deref(),
                self.settings.min_accountability_text_len,
            )?)
        } else {
            optional_text("notes", input.notes.as_deref(), MAX_DECISION_NOTES_LEN)?
        };
        if let Some(n) = &notes {
            if n.chars().count() > MAX_DECISION_NOTES_LEN {
                return Err(EngineError::validation(
                    "notes",
                    format!("notes不能超过 {} 个字符", MAX_DECISION_NOTES_LEN),
                ));
            }
        }

        if let Some(t) = input.temperature_c {
            let (min, max) = VERIFIED_TEMPERATURE_RANGE;
            if !t.is_finite() || t < min || t > max {
                return Err(EngineError::validation(
                    "temperature_c",
                    format!("复核温度必须在 [{}, {}] 之间", min, max),
                ));
            }
        }

        let decision = QcDecision {
            decision_id: Uuid::new_v4().to_string(),
            lot_id: input.lot_id,
            gate_id: input.gate_id,
            operator_id: operator_id.trim().to_string(),
            decision: input.decision,
            notes,
            temperature_c: input.temperature_c,
            digital_signature: input
                .digital_signature
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            decided_at: now,
        };

        with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            if LotRepository::find_by_id_tx(tx, &decision.lot_id)?.is_none() {
                return Err(EngineError::not_found("Lot", &decision.lot_id));
            }
            if QcRepository::find_gate_tx(tx, &decision.gate_id)?.is_none() {
                return Err(EngineError::not_found("QcGate", &decision.gate_id));
            }
            QcRepository::insert_decision_tx(tx, &decision)?;
            Ok(())
        })?;

        info!(
            lot_id = %decision.lot_id,
            gate_id = %decision.gate_id,
            decision = %decision.decision,
            operator_id = %decision.operator_id,
            "质检结论已记录"
        );
        Ok(decision)
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 某批次在某关卡的最新结论
    pub fn latest_decision(&self, lot_id: &str, gate_id: &str) -> EngineResult<Option<QcDecision>> {
        Ok(self.repos.qc_repo.latest_decision(lot_id, gate_id)?)
    }

    /// 某批次的全部结论历史
    pub fn history(&self, lot_id: &str) -> EngineResult<Vec<QcDecision>> {
        Ok(self.repos.qc_repo.history_for_lot(lot_id)?)
    }

    pub fn list_gates(&self) -> EngineResult<Vec<QcGate>> {
        Ok(self.repos.qc_repo.list_gates()?)
    }

    /// 当前已提交数据下判定某运行某工序的关卡
    pub fn evaluate_step(&self, run_id: &str, step: &FlowStep) -> EngineResult<GateOutcome> {
        with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
            Self::evaluate_step_tx(conn, run_id, step)
        })
    }

    // ==========================================
    // 关卡判定 (供运行状态机在写事务内调用)
    // ==========================================

    /// 判定工序关卡
    ///
    /// # 规则
    /// - 工序未绑定关卡 / 关卡非 BLOCKING → Open
    /// - 工序下无登记批次 → Blocked
    /// - 任一批次无结论或最新结论非 PASS → Blocked
    pub fn evaluate_step_tx(
        conn: &Connection,
        run_id: &str,
        step: &FlowStep,
    ) -> EngineResult<GateOutcome> {
        let Some(gate_id) = step.qc_gate_id.as_deref() else {
            return Ok(GateOutcome::Open);
        };
        let gate = QcRepository::find_gate_tx(conn, gate_id)?
            .ok_or_else(|| EngineError::not_found("QcGate", gate_id))?;
        if !gate.is_blocking() {
            return Ok(GateOutcome::Open);
        }

        let lots = LotRepository::find_by_run_step_tx(conn, run_id, step.index)?;
        if lots.is_empty() {
            return Ok(GateOutcome::Blocked {
                gate_code: gate.gate_code,
                reason: format!("工序 {} 尚无登记批次,缺少质检结论", step.node_id),
            });
        }

        for lot in &lots {
            match QcRepository::latest_decision_tx(conn, &lot.lot_id, &gate.gate_id)? {
                Some(d) if d.decision == Decision::Pass => continue,
                Some(d) => {
                    warn!(
                        run_id = %run_id,
                        lot_id = %lot.lot_id,
                        gate_code = %gate.gate_code,
                        decision = %d.decision,
                        "关卡阻断: 最新结论非 PASS"
                    );
                    return Ok(GateOutcome::Blocked {
                        gate_code: gate.gate_code,
                        reason: format!("批次 {} 最新质检结论为 {}", lot.lot_code, d.decision),
                    });
                }
                None => {
                    return Ok(GateOutcome::Blocked {
                        gate_code: gate.gate_code,
                        reason: format!("批次 {} 尚无质检结论", lot.lot_code),
                    });
                }
            }
        }

        Ok(GateOutcome::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_shared;
    use crate::domain::lot::Lot;
    use crate::domain::types::LotType;
    use std::time::Duration;

    fn setup() -> QcGateEngine {
        let conn = open_in_memory_shared().unwrap();
        {
            let c = conn.lock().unwrap();
            LotRepository::insert_tx(
                &c,
                &Lot {
                    lot_id: "L1".to_string(),
                    lot_code: "RAW-20260119-0001".to_string(),
                    lot_type: LotType::Raw,
                    run_id: None,
                    step_index: None,
                    weight_kg: Some(100.0),
                    temperature_c: Some(2.0),
                    metadata: serde_json::json!({}),
                    operator_id: None,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        }
        let repos = TraceRepositories::new(conn, Duration::from_secs(1));
        QcGateEngine::new(repos, EngineSettings::default())
    }

    fn input(decision: Decision, notes: Option<&str>) -> NewQcDecision {
        NewQcDecision {
            lot_id: "L1".to_string(),
            gate_id: "gate-receipt".to_string(),
            decision,
            notes: notes.map(str::to_string),
            temperature_c: Some(3.5),
            digital_signature: None,
        }
    }

    #[test]
    fn test_hold_notes_length_boundary() {
        let engine = setup();
        let err = engine
            .record_decision(input(Decision::Hold, Some("123456789")), "qa-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "notes"));

        let ok = engine
            .record_decision(input(Decision::Hold, Some("1234567890")), "qa-1", Utc::now())
            .unwrap();
        assert_eq!(ok.notes.as_deref(), Some("1234567890"));
    }

    #[test]
    fn test_fail_without_notes_rejected_pass_without_notes_ok() {
        let engine = setup();
        assert!(engine
            .record_decision(input(Decision::Fail, None), "qa-1", Utc::now())
            .is_err());
        assert!(engine
            .record_decision(input(Decision::Pass, None), "qa-1", Utc::now())
            .is_ok());
    }

    #[test]
    fn test_history_is_appended_and_latest_wins() {
        let engine = setup();
        let t0 = Utc::now();
        engine
            .record_decision(input(Decision::Fail, Some("温度超标 6.2°C 需复检")), "qa-1", t0)
            .unwrap();
        engine
            .record_decision(
                input(Decision::Pass, None),
                "qa-2",
                t0 + chrono::Duration::seconds(5),
            )
            .unwrap();

        assert_eq!(engine.history("L1").unwrap().len(), 2);
        let latest = engine.latest_decision("L1", "gate-receipt").unwrap().unwrap();
        assert_eq!(latest.decision, Decision::Pass);
        assert_eq!(latest.operator_id, "qa-2");
    }

    #[test]
    fn test_unknown_lot_and_gate() {
        let engine = setup();
        let mut bad_lot = input(Decision::Pass, None);
        bad_lot.lot_id = "missing".to_string();
        assert!(matches!(
            engine.record_decision(bad_lot, "qa-1", Utc::now()),
            Err(EngineError::NotFound { .. })
        ));

        let mut bad_gate = input(Decision::Pass, None);
        bad_gate.gate_id = "missing".to_string();
        assert!(matches!(
            engine.record_decision(bad_gate, "qa-1", Utc::now()),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_temperature_range() {
        let engine = setup();
        let mut too_hot = input(Decision::Pass, None);
        too_hot.temperature_c = Some(100.5);
        assert!(engine.record_decision(too_hot, "qa-1", Utc::now()).is_err());
    }

    #[test]
    fn test_step_without_gate_is_open() {
        let engine = setup();
        let step = FlowStep {
            index: 0,
            node_id: "start".to_string(),
            name: "开工".to_string(),
            qc_gate_id: None,
        };
        assert_eq!(engine.evaluate_step("R1", &step).unwrap(), GateOutcome::Open);

        let checkpoint = FlowStep {
            qc_gate_id: Some("gate-mixing".to_string()),
            ..step
        };
        assert_eq!(
            engine.evaluate_step("R1", &checkpoint).unwrap(),
            GateOutcome::Open
        );
    }
}
