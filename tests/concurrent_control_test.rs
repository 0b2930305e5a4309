// ==========================================
// 并发控制测试
// ==========================================
// 职责: 验证同一运行的并发推进不会同时成功、并发幂等创建只生成一条记录
// ==========================================


#[cfg(test)]
mod concurrent_control_test {
    use chrono::Utc;
    use haccp_trace::config::EngineSettings;
    use haccp_trace::db::CANONICAL_FLOW_VERSION_ID;
    use haccp_trace::domain::run::RunAction;
    use haccp_trace::engine::{CreateRunRequest, EngineError, RunLifecycleEngine};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use crate::test_helpers::{insert_published_flow, setup_repos};

    const THREADS: usize = 8;

    fn engine_with_long_flow() -> (tempfile::NamedTempFile, Arc<RunLifecycleEngine>) {
        let (tmp, _conn, repos) = setup_repos();
        insert_published_flow(&repos, "long", &[None; 12]);
        (tmp, Arc::new(RunLifecycleEngine::new(repos, EngineSettings::default())))
    }

    fn started_run(engine: &RunLifecycleEngine, key: &str) -> String {
        let run = engine
            .create(
                CreateRunRequest {
                    flow_version_id: "long".to_string(),
                    idempotency_key: key.to_string(),
                    daily_target_kg: None,
                },
                "mgr-1",
                Utc::now(),
            )
            .unwrap()
            .run;
        engine.start(&run.run_id, "op-1", Utc::now()).unwrap();
        run.run_id
    }

    #[test]
    fn test_concurrent_advance_same_expected_step_only_one_wins() {
        let (_tmp, engine) = engine_with_long_flow();
        let run_id = started_run(&engine, "race");
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let engine = engine.clone();
                let run_id = run_id.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.advance(&run_id, None, Some(0), &format!("op-{}", i), Utc::now())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1, "exactly one advance should win: {:?}", results);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::Conflict(_))));

        let run = engine.get(&run_id).unwrap();
        assert_eq!(run.current_step_index, 1);
    }

    #[test]
    fn test_concurrent_advance_without_expectation_is_serialized() {
        let (_tmp, engine) = engine_with_long_flow();
        let run_id = started_run(&engine, "serial");
        let n = 5;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let engine = engine.clone();
                let run_id = run_id.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.advance(&run_id, None, None, "op", Utc::now())
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap().unwrap();
        }

        let run = engine.get(&run_id).unwrap();
        assert_eq!(run.current_step_index, n as i32);
        // revision: create=0, start=1, 每次推进 +1
        assert_eq!(run.revision, 1 + n as i32);

        let advances = engine
            .events(&run_id)
            .unwrap()
            .iter()
            .filter(|e| e.action == RunAction::Advance)
            .count();
        assert_eq!(advances, n);
    }

    #[test]
    fn test_concurrent_create_same_key() {
        let (_tmp, _conn, repos) = setup_repos();
        let engine = Arc::new(RunLifecycleEngine::new(repos, EngineSettings::default()));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.create(
                        CreateRunRequest {
                            flow_version_id: CANONICAL_FLOW_VERSION_ID.to_string(),
                            idempotency_key: "same-key".to_string(),
                            daily_target_kg: None,
                        },
                        "mgr-1",
                        Utc::now(),
                    )
                })
            })
            .collect();

        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
        let first_id = &outcomes[0].run.run_id;
        assert!(outcomes.iter().all(|o| &o.run.run_id == first_id));
        assert_eq!(engine.list(None).unwrap().len(), 1);
    }
}
