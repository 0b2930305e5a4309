// ==========================================
// 质检关卡集成测试
// ==========================================
// 职责: 验证结论说明要求、追加式历史、最新结论
// ==========================================


#[cfg(test)]
mod qc_gate_test {
    use chrono::{Duration, Utc};
    use haccp_trace::config::EngineSettings;
    use haccp_trace::domain::qc::NewQcDecision;
    use haccp_trace::domain::types::{Decision, LotType};
    use haccp_trace::engine::{EngineError, LotRegistrationService, QcGateEngine};

    use crate::test_helpers::{register_lot, setup_repos};

    fn decision(lot_id: &str, decision: Decision, notes: Option<&str>) -> NewQcDecision {
        NewQcDecision {
            lot_id: lot_id.to_string(),
            gate_id: "gate-receipt".to_string(),
            decision,
            notes: notes.map(str::to_string),
            temperature_c: Some(3.1),
            digital_signature: None,
        }
    }

    fn setup() -> (tempfile::NamedTempFile, QcGateEngine, String) {
        let (tmp, _conn, repos) = setup_repos();
        let settings = EngineSettings::default();
        let lots = LotRegistrationService::new(repos.clone(), settings.clone());
        let lot = register_lot(&lots, LotType::Raw, &[], Utc::now());
        (tmp, QcGateEngine::new(repos, settings), lot.lot_id)
    }

    #[test]
    fn test_hold_notes_length_boundary() {
        let (_tmp, qc, lot_id) = setup();

        let err = qc
            .record_decision(decision(&lot_id, Decision::Hold, Some("123456789")), "qa-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(qc.history(&lot_id).unwrap().is_empty());

        qc.record_decision(decision(&lot_id, Decision::Hold, Some("1234567890")), "qa-1", Utc::now())
            .unwrap();
        assert_eq!(qc.history(&lot_id).unwrap().len(), 1);
    }

    #[test]
    fn test_fail_requires_notes_pass_does_not() {
        let (_tmp, qc, lot_id) = setup();

        assert!(qc
            .record_decision(decision(&lot_id, Decision::Fail, None), "qa-1", Utc::now())
            .is_err());
        assert!(qc
            .record_decision(decision(&lot_id, Decision::Pass, None), "qa-1", Utc::now())
            .is_ok());
    }

    #[test]
    fn test_latest_decision_wins_and_history_is_kept() {
        let (_tmp, qc, lot_id) = setup();
        let t0 = Utc::now();

        qc.record_decision(decision(&lot_id, Decision::Hold, Some("表面温度偏高等待复测")), "qa-1", t0)
            .unwrap();
        qc.record_decision(decision(&lot_id, Decision::Pass, None), "qa-2", t0 + Duration::minutes(5))
            .unwrap();

        let latest = qc.latest_decision(&lot_id, "gate-receipt").unwrap().unwrap();
        assert_eq!(latest.decision, Decision::Pass);
        assert_eq!(latest.operator_id, "qa-2");
        assert_eq!(qc.history(&lot_id).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_gate_or_lot() {
        let (_tmp, qc, lot_id) = setup();

        let mut input = decision(&lot_id, Decision::Pass, None);
        input.gate_id = "gate-unknown".to_string();
        assert!(matches!(
            qc.record_decision(input, "qa-1", Utc::now()),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            qc.record_decision(decision("lot-unknown", Decision::Pass, None), "qa-1", Utc::now()),
            Err(EngineError::NotFound { .. })
        ));
        assert_eq!(qc.list_gates().unwrap().len(), 4);
    }
}
