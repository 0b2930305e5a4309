// ==========================================
// 生产运行状态机集成测试
// ==========================================
// 职责: 验证完整运行场景、幂等创建、关卡阻断、状态迁移表
// ==========================================


#[cfg(test)]
mod run_lifecycle_test {
    use chrono::{Duration, Utc};
    use haccp_trace::config::EngineSettings;
    use haccp_trace::db::CANONICAL_FLOW_VERSION_ID;
    use haccp_trace::domain::lot::LotRegistration;
    use haccp_trace::domain::qc::NewQcDecision;
    use haccp_trace::domain::run::RunAction;
    use haccp_trace::domain::types::{Decision, LotType, RunStatus, StepExecutionStatus};
    use haccp_trace::engine::{
        CreateRunRequest, EngineError, LotRegistrationService, QcGateEngine, RunLifecycleEngine,
    };

    use crate::test_helpers::{insert_published_flow, setup_repos, ACCOUNTABLE_REASON};

    fn request(flow: &str, key: &str) -> CreateRunRequest {
        CreateRunRequest {
            flow_version_id: flow.to_string(),
            idempotency_key: key.to_string(),
            daily_target_kg: None,
        }
    }

    // ==========================================
    // 场景: 创建 → 启动 → 关卡阻断 → PASS → 推进
    // ==========================================
    #[test]
    fn test_gate_blocked_until_pass_then_advances() {
        haccp_trace::logging::init_test();
        let (_tmp, _conn, repos) = setup_repos();
        insert_published_flow(&repos, "gate-at-start", &[Some("gate-receipt"), None, None]);

        let settings = EngineSettings::default();
        let runs = RunLifecycleEngine::new(repos.clone(), settings.clone());
        let lots = LotRegistrationService::new(repos.clone(), settings.clone());
        let qc = QcGateEngine::new(repos.clone(), settings);

        let run = runs
            .create(request("gate-at-start", "scenario-1"), "mgr-1", Utc::now())
            .unwrap()
            .run;
        assert_eq!(run.status, RunStatus::Idle);

        let run = runs.start(&run.run_id, "op-1", Utc::now()).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 0);

        // 无批次、无结论 → 阻断
        let err = runs
            .advance(&run.run_id, None, None, "op-1", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::GateBlocked { step_index: 0, .. }));

        let lot = lots
            .register(
                LotRegistration {
                    run_id: Some(run.run_id.clone()),
                    step_index: Some(0),
                    weight_kg: Some(420.0),
                    temperature_c: Some(2.8),
                    ..LotRegistration::new(LotType::Raw)
                },
                "op-1",
                Utc::now(),
            )
            .unwrap()
            .lot;

        // 批次已登记但无结论 → 仍阻断
        assert!(matches!(
            runs.advance(&run.run_id, None, None, "op-1", Utc::now()),
            Err(EngineError::GateBlocked { .. })
        ));

        qc.record_decision(
            NewQcDecision {
                lot_id: lot.lot_id.clone(),
                gate_id: "gate-receipt".to_string(),
                decision: Decision::Pass,
                notes: None,
                temperature_c: Some(2.8),
                digital_signature: Some("sig-qa-1".to_string()),
            },
            "qa-1",
            Utc::now(),
        )
        .unwrap();

        let out = runs
            .advance(&run.run_id, Some("收货完成"), None, "op-1", Utc::now())
            .unwrap();
        assert_eq!(out.run.current_step_index, 1);
        assert_eq!(out.completed_step.step_index, 0);
        assert_eq!(out.completed_step.status, StepExecutionStatus::Completed);
        assert_eq!(out.next_step.step_index, 1);

        let steps = runs.steps(&run.run_id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].status, StepExecutionStatus::InProgress);
    }

    #[test]
    fn test_latest_fail_after_pass_blocks_again() {
        let (_tmp, _conn, repos) = setup_repos();
        insert_published_flow(&repos, "gate-at-start", &[Some("gate-freezing"), None]);
        let settings = EngineSettings::default();
        let runs = RunLifecycleEngine::new(repos.clone(), settings.clone());
        let lots = LotRegistrationService::new(repos.clone(), settings.clone());
        let qc = QcGateEngine::new(repos.clone(), settings);

        let run = runs.create(request("gate-at-start", "k"), "mgr-1", Utc::now()).unwrap().run;
        runs.start(&run.run_id, "op-1", Utc::now()).unwrap();
        let lot = lots
            .register(
                LotRegistration {
                    run_id: Some(run.run_id.clone()),
                    step_index: Some(0),
                    ..LotRegistration::new(LotType::Frozen)
                },
                "op-1",
                Utc::now(),
            )
            .unwrap()
            .lot;

        let t0 = Utc::now();
        let decide = |decision: Decision, notes: Option<&str>, offset: i64| {
            qc.record_decision(
                NewQcDecision {
                    lot_id: lot.lot_id.clone(),
                    gate_id: "gate-freezing".to_string(),
                    decision,
                    notes: notes.map(str::to_string),
                    temperature_c: Some(-19.0),
                    digital_signature: None,
                },
                "qa-1",
                t0 + Duration::seconds(offset),
            )
            .unwrap();
        };
        decide(Decision::Pass, None, 0);
        decide(Decision::Hold, Some("中心温度复测结果待确认"), 10);

        assert!(matches!(
            runs.advance(&run.run_id, None, None, "op-1", Utc::now()),
            Err(EngineError::GateBlocked { .. })
        ));
        assert_eq!(qc.history(&lot.lot_id).unwrap().len(), 2);
    }

    // ==========================================
    // 幂等创建
    // ==========================================
    #[test]
    fn test_create_twice_same_key_single_record() {
        let (_tmp, _conn, repos) = setup_repos();
        let runs = RunLifecycleEngine::new(repos, EngineSettings::default());

        let a = runs
            .create(request(CANONICAL_FLOW_VERSION_ID, "retry-key"), "mgr-1", Utc::now())
            .unwrap();
        let b = runs
            .create(request(CANONICAL_FLOW_VERSION_ID, "retry-key"), "mgr-1", Utc::now())
            .unwrap();

        assert_eq!(a.run.run_id, b.run.run_id);
        assert!(a.created && !b.created);
        assert_eq!(runs.list(None).unwrap().len(), 1);

        let creates = runs
            .events(&a.run.run_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.action == RunAction::Create)
            .count();
        assert_eq!(creates, 1);
    }

    // ==========================================
    // 状态迁移
    // ==========================================
    #[test]
    fn test_full_lifecycle_on_ungated_flow() {
        let (_tmp, _conn, repos) = setup_repos();
        insert_published_flow(&repos, "three", &[None, None, None]);
        let runs = RunLifecycleEngine::new(repos, EngineSettings::default());

        let run = runs.create(request("three", "k"), "mgr-1", Utc::now()).unwrap().run;
        runs.start(&run.run_id, "op-1", Utc::now()).unwrap();
        runs.hold(&run.run_id, Some(ACCOUNTABLE_REASON), "op-1", Utc::now()).unwrap();

        // HOLD 状态不可推进
        assert!(matches!(
            runs.advance(&run.run_id, None, None, "op-1", Utc::now()),
            Err(EngineError::InvalidTransition { from: RunStatus::Hold, .. })
        ));

        runs.resume(&run.run_id, Some("报警已复核为误报可以继续"), "mgr-1", Utc::now())
            .unwrap();
        runs.advance(&run.run_id, None, None, "op-1", Utc::now()).unwrap();
        runs.advance(&run.run_id, None, None, "op-1", Utc::now()).unwrap();
        assert!(matches!(
            runs.advance(&run.run_id, None, None, "op-1", Utc::now()),
            Err(EngineError::AtTerminalStep { step_index: 2, .. })
        ));

        let done = runs.complete(&run.run_id, "op-1", Utc::now()).unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        // 终态: 除归档外全部拒绝,且状态不变
        for result in [
            runs.start(&run.run_id, "op-1", Utc::now()),
            runs.hold(&run.run_id, Some(ACCOUNTABLE_REASON), "op-1", Utc::now()),
            runs.abort(&run.run_id, Some(ACCOUNTABLE_REASON), "mgr-1", Utc::now()),
            runs.complete(&run.run_id, "op-1", Utc::now()),
        ] {
            assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
        }
        assert_eq!(runs.get(&run.run_id).unwrap().status, RunStatus::Completed);

        let archived = runs.archive(&run.run_id, "mgr-1", Utc::now()).unwrap();
        assert_eq!(archived.status, RunStatus::Archived);

        let actions: Vec<RunAction> = runs
            .events(&run.run_id)
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                RunAction::Create,
                RunAction::Start,
                RunAction::Hold,
                RunAction::Resume,
                RunAction::Advance,
                RunAction::Advance,
                RunAction::Complete,
                RunAction::Archive,
            ]
        );
    }

    #[test]
    fn test_complete_with_steps_remaining() {
        let (_tmp, _conn, repos) = setup_repos();
        let runs = RunLifecycleEngine::new(repos, EngineSettings::default());
        let run = runs
            .create(request(CANONICAL_FLOW_VERSION_ID, "k"), "mgr-1", Utc::now())
            .unwrap()
            .run;
        runs.start(&run.run_id, "op-1", Utc::now()).unwrap();

        match runs.complete(&run.run_id, "op-1", Utc::now()) {
            Err(EngineError::StepsRemaining {
                current_step,
                final_step,
                ..
            }) => {
                assert_eq!(current_step, 0);
                assert_eq!(final_step, 10);
            }
            other => panic!("expected StepsRemaining, got {:?}", other),
        }
    }

    #[test]
    fn test_accountability_text_required() {
        let (_tmp, _conn, repos) = setup_repos();
        let runs = RunLifecycleEngine::new(repos, EngineSettings::default());
        let run = runs
            .create(request(CANONICAL_FLOW_VERSION_ID, "k"), "mgr-1", Utc::now())
            .unwrap()
            .run;
        runs.start(&run.run_id, "op-1", Utc::now()).unwrap();

        assert!(runs.hold(&run.run_id, None, "op-1", Utc::now()).is_err());
        assert!(runs.hold(&run.run_id, Some("123456789"), "op-1", Utc::now()).is_err());
        assert!(runs.abort(&run.run_id, Some("   "), "mgr-1", Utc::now()).is_err());
        assert!(runs.hold(&run.run_id, Some("1234567890"), "op-1", Utc::now()).is_ok());
    }
}
