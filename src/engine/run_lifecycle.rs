// ==========================================
// 生产批次追溯引擎 - 生产运行状态机
// ==========================================
// 状态: IDLE → RUNNING → {HOLD ↔ RUNNING} → COMPLETED
//       IDLE / RUNNING / HOLD → ABORTED
//       COMPLETED / ABORTED → ARCHIVED
// 红线: 每个变更入口 = 一个 BEGIN IMMEDIATE 事务 (读 → 校验 → 写 → 提交)
// 红线: 运行行带 revision 乐观锁; 并发推进不会同时成功
// 红线: 每次状态迁移追加 RunEvent
// ==========================================

use crate::config::EngineSettings;
use crate::db::{with_read, with_write_tx};
use crate::domain::buffer::BufferInventory;
use crate::domain::flow::{FlowStep, FlowVersion};
use crate::domain::run::{ProductionRun, RunAction, RunEvent, RunStepExecution};
use crate::domain::types::{RunStatus, StepExecutionStatus};
use crate::engine::accountability::{optional_text, require_text};
use crate::engine::buffer_inventory::BufferInventoryManager;
use crate::engine::codes::{next_sequence, run_code_prefix, with_sequence};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::qc_gate::{GateOutcome, QcGateEngine};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{FlowRepository, RunRepository};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// 幂等键最大长度
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

// ==========================================
// 状态迁移表
// ==========================================

/// 给定当前状态与动作,返回目标状态; 不允许的组合返回 None
pub fn next_status(from: RunStatus, action: RunAction) -> Option<RunStatus> {
    use RunAction as A;
    use RunStatus as S;
    match (from, action) {
        (S::Idle, A::Start) => Some(S::Running),
        (S::Running, A::Advance) => Some(S::Running),
        (S::Running, A::Hold) => Some(S::Hold),
        (S::Hold, A::Resume) => Some(S::Running),
        (S::Running, A::Complete) => Some(S::Completed),
        (S::Idle | S::Running | S::Hold, A::Abort) => Some(S::Aborted),
        (S::Completed | S::Aborted, A::Archive) => Some(S::Archived),
        _ => None,
    }
}

// ==========================================
// 请求 / 结果
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub flow_version_id: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub daily_target_kg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub run: ProductionRun,
    pub created: bool, // false = 幂等键命中,返回既有运行
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub run: ProductionRun,
    pub completed_step: RunStepExecution,
    pub next_step: RunStepExecution,
}

// ==========================================
// RunLifecycleEngine - 生产运行状态机
// ==========================================
pub struct RunLifecycleEngine {
    repos: TraceRepositories,
    settings: EngineSettings,
}

impl RunLifecycleEngine {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self { repos, settings }
    }

    // ==========================================
    // 创建 (幂等)
    // ==========================================

    /// 创建运行
    ///
    /// # 参数
    /// - req: 工艺版本 + 幂等键
    /// - actor: 创建人
    /// - now: 创建时间 (运行编码按其 UTC 日期生成)
    ///
    /// # 返回
    /// - Ok(CreateOutcome { created: true }): 新运行 (IDLE, 工序 0)
    /// - Ok(CreateOutcome { created: false }): 同一幂等键的既有运行
    /// - Err(NotFound): 工艺版本不存在
    /// - Err(Validation): 幂等键非法 / 工艺版本未发布
    pub fn create(
        &self,
        req: CreateRunRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<CreateOutcome> {
        let key = req.idempotency_key.trim().to_string();
        if key.is_empty() {
            return Err(EngineError::validation("idempotency_key", "幂等键不能为空"));
        }
        if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::validation(
                "idempotency_key",
                format!("幂等键不能超过 {} 个字符", MAX_IDEMPOTENCY_KEY_LEN),
            ));
        }
        if let Some(target) = req.daily_target_kg {
            if !target.is_finite() || target < 0.0 {
                return Err(EngineError::validation("daily_target_kg", "日目标产量不能为负数"));
            }
        }

        let result = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            if let Some(existing) = RunRepository::find_by_idempotency_key_tx(tx, &key)? {
                return Ok(CreateOutcome {
                    run: existing,
                    created: false,
                });
            }

            let flow = FlowRepository::find_by_id_tx(tx, &req.flow_version_id)?
                .ok_or_else(|| EngineError::not_found("FlowVersion", &req.flow_version_id))?;
            if !flow.is_published() {
                return Err(EngineError::validation(
                    "flow_version_id",
                    format!("工艺版本 {} 状态为 {},只能基于已发布版本创建运行", flow.flow_version_id, flow.status),
                ));
            }
            if flow.final_step_index().is_none() {
                return Err(EngineError::validation("flow_version_id", "工艺版本没有任何工序"));
            }

            let prefix = run_code_prefix(now.date_naive(), &self.settings.site_code);
            let sequence = next_sequence(&prefix, RunRepository::max_code_sequence_tx(tx, &prefix)?)?;

            let run = ProductionRun {
                run_id: Uuid::new_v4().to_string(),
                run_code: with_sequence(&prefix, sequence),
                flow_version_id: flow.flow_version_id.clone(),
                status: RunStatus::Idle,
                current_step_index: 0,
                idempotency_key: key.clone(),
                daily_target_kg: req.daily_target_kg,
                created_by: actor.to_string(),
                created_at: now,
                started_at: None,
                completed_at: None,
                ended_at: None,
                hold_reason: None,
                abort_reason: None,
                revision: 0,
            };
            RunRepository::insert_tx(tx, &run)?;
            Self::append_event_tx(tx, &run, RunAction::Create, None, actor, None, now)?;

            Ok(CreateOutcome { run, created: true })
        });

        match result {
            Ok(outcome) => {
                if outcome.created {
                    info!(
                        run_id = %outcome.run.run_id,
                        run_code = %outcome.run.run_code,
                        flow_version_id = %outcome.run.flow_version_id,
                        actor = %actor,
                        "生产运行已创建"
                    );
                } else {
                    info!(
                        run_id = %outcome.run.run_id,
                        idempotency_key = %key,
                        "幂等键命中,返回既有运行"
                    );
                }
                Ok(outcome)
            }
            // 另一连接抢先写入同一幂等键
            Err(EngineError::Conflict(msg)) => {
                let existing = with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
                    RunRepository::find_by_idempotency_key_tx(conn, &key)
                })?;
                match existing {
                    Some(run) => Ok(CreateOutcome { run, created: false }),
                    None => Err(EngineError::Conflict(msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    // ==========================================
    // 状态迁移
    // ==========================================

    /// IDLE → RUNNING,工序 0 置为进行中
    pub fn start(&self, run_id: &str, actor: &str, now: DateTime<Utc>) -> EngineResult<ProductionRun> {
        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            let to = Self::check_transition(&run, RunAction::Start)?;
            let flow = Self::load_flow_tx(tx, &run)?;
            let step = Self::flow_step(&flow, run.current_step_index)?;

            run.status = to;
            run.started_at = Some(now);
            Self::open_step_tx(tx, &run.run_id, step, actor, now)?;
            Self::persist_tx(tx, run, from, RunAction::Start, actor, None, now)
        })?;

        info!(run_id = %run.run_id, actor = %actor, "生产运行已启动");
        Ok(run)
    }

    /// 推进到下一工序
    ///
    /// # 参数
    /// - notes: 可选备注 (写入工序记录与审计事件)
    /// - expected_step_index: 调用方看到的当前工序; 不一致 → Conflict
    ///
    /// # 错误顺序
    /// 1. 非 RUNNING → InvalidTransition
    /// 2. expected_step_index 不一致 → Conflict
    /// 3. 已在最终工序 → AtTerminalStep
    /// 4. 当前工序阻断关卡未放行 → GateBlocked
    pub fn advance(
        &self,
        run_id: &str,
        notes: Option<&str>,
        expected_step_index: Option<i32>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<AdvanceOutcome> {
        let notes = optional_text("notes", notes, self.settings.max_notes_len)?;

        let outcome = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            let to = Self::check_transition(&run, RunAction::Advance)?;

            if let Some(expected) = expected_step_index {
                if expected != run.current_step_index {
                    return Err(EngineError::Conflict(format!(
                        "运行 {} 当前工序为 {},调用方期望 {}",
                        run.run_id, run.current_step_index, expected
                    )));
                }
            }

            let flow = Self::load_flow_tx(tx, &run)?;
            let final_index = Self::final_index(&flow)?;
            if run.current_step_index >= final_index {
                warn!(
                    run_id = %run.run_id,
                    step_index = run.current_step_index,
                    "已到最终工序,拒绝推进"
                );
                return Err(EngineError::AtTerminalStep {
                    run_id: run.run_id.clone(),
                    step_index: run.current_step_index,
                });
            }

            let current = Self::flow_step(&flow, run.current_step_index)?;
            Self::require_gate_open_tx(tx, &run, current)?;
            let completed_step = Self::close_step_tx(tx, &run.run_id, current, actor, notes.clone(), now)?;

            let next = Self::flow_step(&flow, run.current_step_index + 1)?;
            let next_step = Self::open_step_tx(tx, &run.run_id, next, actor, now)?;

            run.status = to;
            run.current_step_index = next.index;
            let run = Self::persist_tx(tx, run, from, RunAction::Advance, actor, notes.clone(), now)?;

            Ok(AdvanceOutcome {
                run,
                completed_step,
                next_step,
            })
        })?;

        info!(
            run_id = %outcome.run.run_id,
            step_index = outcome.run.current_step_index,
            actor = %actor,
            "生产运行已推进"
        );
        Ok(outcome)
    }

    /// RUNNING → HOLD
    pub fn hold(
        &self,
        run_id: &str,
        reason: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProductionRun> {
        let reason = require_text("reason", reason, self.settings.min_accountability_text_len)?;

        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            run.status = Self::check_transition(&run, RunAction::Hold)?;
            run.hold_reason = Some(reason.clone());
            Self::persist_tx(tx, run, from, RunAction::Hold, actor, Some(reason.clone()), now)
        })?;

        info!(run_id = %run.run_id, actor = %actor, reason = %reason, "生产运行已暂停");
        Ok(run)
    }

    /// HOLD → RUNNING; 暂停原因清空,历史保留在审计事件中
    pub fn resume(
        &self,
        run_id: &str,
        resolution: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProductionRun> {
        let resolution = require_text(
            "resolution",
            resolution,
            self.settings.min_accountability_text_len,
        )?;

        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            run.status = Self::check_transition(&run, RunAction::Resume)?;
            run.hold_reason = None;
            Self::persist_tx(tx, run, from, RunAction::Resume, actor, Some(resolution.clone()), now)
        })?;

        info!(run_id = %run.run_id, actor = %actor, "生产运行已恢复");
        Ok(run)
    }

    /// RUNNING → COMPLETED (必须位于最终工序,且最终工序关卡放行)
    pub fn complete(&self, run_id: &str, actor: &str, now: DateTime<Utc>) -> EngineResult<ProductionRun> {
        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            let to = Self::check_transition(&run, RunAction::Complete)?;

            let flow = Self::load_flow_tx(tx, &run)?;
            let final_index = Self::final_index(&flow)?;
            if run.current_step_index != final_index {
                warn!(
                    run_id = %run.run_id,
                    current_step = run.current_step_index,
                    final_step = final_index,
                    "仍有未完成工序,拒绝完成"
                );
                return Err(EngineError::StepsRemaining {
                    run_id: run.run_id.clone(),
                    current_step: run.current_step_index,
                    final_step: final_index,
                });
            }

            let last = Self::flow_step(&flow, final_index)?;
            Self::require_gate_open_tx(tx, &run, last)?;
            Self::close_step_tx(tx, &run.run_id, last, actor, None, now)?;

            run.status = to;
            run.completed_at = Some(now);
            run.ended_at = Some(now);
            Self::persist_tx(tx, run, from, RunAction::Complete, actor, None, now)
        })?;

        info!(run_id = %run.run_id, actor = %actor, "生产运行已完成");
        Ok(run)
    }

    /// IDLE / RUNNING / HOLD → ABORTED
    pub fn abort(
        &self,
        run_id: &str,
        reason: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ProductionRun> {
        let reason = require_text("reason", reason, self.settings.min_accountability_text_len)?;

        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            run.status = Self::check_transition(&run, RunAction::Abort)?;
            run.abort_reason = Some(reason.clone());
            run.ended_at = Some(now);
            Self::persist_tx(tx, run, from, RunAction::Abort, actor, Some(reason.clone()), now)
        })?;

        warn!(run_id = %run.run_id, actor = %actor, reason = %reason, "生产运行已中止");
        Ok(run)
    }

    /// COMPLETED / ABORTED → ARCHIVED
    pub fn archive(&self, run_id: &str, actor: &str, now: DateTime<Utc>) -> EngineResult<ProductionRun> {
        let run = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let mut run = Self::load_run_tx(tx, run_id)?;
            let from = run.status;
            run.status = Self::check_transition(&run, RunAction::Archive)?;
            Self::persist_tx(tx, run, from, RunAction::Archive, actor, None, now)
        })?;

        info!(run_id = %run.run_id, actor = %actor, "生产运行已归档");
        Ok(run)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get(&self, run_id: &str) -> EngineResult<ProductionRun> {
        self.repos
            .run_repo
            .find_by_id(run_id)?
            .ok_or_else(|| EngineError::not_found("ProductionRun", run_id))
    }

    /// 运行列表 (最新在前)
    pub fn list(&self, status_filter: Option<RunStatus>) -> EngineResult<Vec<ProductionRun>> {
        Ok(self.repos.run_repo.list(status_filter)?)
    }

    /// 工序执行记录 (按工序序号升序)
    pub fn steps(&self, run_id: &str) -> EngineResult<Vec<RunStepExecution>> {
        self.get(run_id)?;
        Ok(self.repos.run_repo.list_steps(run_id)?)
    }

    /// 运行在各缓冲区的在库批次
    pub fn buffers(&self, run_id: &str) -> EngineResult<Vec<BufferInventory>> {
        self.get(run_id)?;
        BufferInventoryManager::new(self.repos.clone(), self.settings.clone())
            .inventories_for_run(run_id)
    }

    /// 审计事件 (按发生顺序)
    pub fn events(&self, run_id: &str) -> EngineResult<Vec<RunEvent>> {
        self.get(run_id)?;
        Ok(self.repos.run_repo.list_events(run_id)?)
    }

    // ==========================================
    // 事务内辅助
    // ==========================================

    fn load_run_tx(conn: &Connection, run_id: &str) -> EngineResult<ProductionRun> {
        RunRepository::find_by_id_tx(conn, run_id)?
            .ok_or_else(|| EngineError::not_found("ProductionRun", run_id))
    }

    fn load_flow_tx(conn: &Connection, run: &ProductionRun) -> EngineResult<FlowVersion> {
        FlowRepository::find_by_id_tx(conn, &run.flow_version_id)?
            .ok_or_else(|| EngineError::not_found("FlowVersion", &run.flow_version_id))
    }

    fn final_index(flow: &FlowVersion) -> EngineResult<i32> {
        flow.final_step_index().ok_or_else(|| {
            EngineError::Storage(format!("工艺版本 {} 没有任何工序", flow.flow_version_id))
        })
    }

    fn flow_step(flow: &FlowVersion, index: i32) -> EngineResult<&FlowStep> {
        flow.step(index).ok_or_else(|| {
            EngineError::Storage(format!(
                "工艺版本 {} 缺少工序 {}",
                flow.flow_version_id, index
            ))
        })
    }

    fn check_transition(run: &ProductionRun, action: RunAction) -> EngineResult<RunStatus> {
        next_status(run.status, action).ok_or_else(|| {
            warn!(
                run_id = %run.run_id,
                status = %run.status,
                action = %action,
                "无效的状态转换"
            );
            EngineError::InvalidTransition {
                run_id: run.run_id.clone(),
                from: run.status,
                action: action.to_db_str().to_string(),
            }
        })
    }

    fn require_gate_open_tx(conn: &Connection, run: &ProductionRun, step: &FlowStep) -> EngineResult<()> {
        match QcGateEngine::evaluate_step_tx(conn, &run.run_id, step)? {
            GateOutcome::Open => Ok(()),
            GateOutcome::Blocked { gate_code, reason } => {
                warn!(
                    run_id = %run.run_id,
                    step_index = step.index,
                    gate_code = %gate_code,
                    reason = %reason,
                    "质检关卡阻断"
                );
                Err(EngineError::GateBlocked {
                    run_id: run.run_id.clone(),
                    step_index: step.index,
                    gate_code,
                    reason,
                })
            }
        }
    }

    /// 工序置为进行中 (不存在则创建)
    fn open_step_tx(
        conn: &Connection,
        run_id: &str,
        step: &FlowStep,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RunStepExecution> {
        match RunRepository::find_step_tx(conn, run_id, step.index)? {
            Some(mut existing) => {
                existing.status = StepExecutionStatus::InProgress;
                existing.started_at = existing.started_at.or(Some(now));
                existing.operator_id = Some(actor.to_string());
                RunRepository::update_step_tx(conn, &existing)?;
                Ok(existing)
            }
            None => {
                let execution = RunStepExecution {
                    execution_id: Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    step_index: step.index,
                    node_id: step.node_id.clone(),
                    status: StepExecutionStatus::InProgress,
                    started_at: Some(now),
                    completed_at: None,
                    operator_id: Some(actor.to_string()),
                    notes: None,
                };
                RunRepository::insert_step_tx(conn, &execution)?;
                Ok(execution)
            }
        }
    }

    /// 工序置为已完成 (缺失记录时直接补建为已完成)
    fn close_step_tx(
        conn: &Connection,
        run_id: &str,
        step: &FlowStep,
        actor: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<RunStepExecution> {
        match RunRepository::find_step_tx(conn, run_id, step.index)? {
            Some(mut existing) => {
                existing.status = StepExecutionStatus::Completed;
                existing.completed_at = Some(now);
                existing.operator_id = Some(actor.to_string());
                if notes.is_some() {
                    existing.notes = notes;
                }
                RunRepository::update_step_tx(conn, &existing)?;
                Ok(existing)
            }
            None => {
                let execution = RunStepExecution {
                    execution_id: Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    step_index: step.index,
                    node_id: step.node_id.clone(),
                    status: StepExecutionStatus::Completed,
                    started_at: Some(now),
                    completed_at: Some(now),
                    operator_id: Some(actor.to_string()),
                    notes,
                };
                RunRepository::insert_step_tx(conn, &execution)?;
                Ok(execution)
            }
        }
    }

    /// 带 revision 校验写回运行,并追加审计事件
    fn persist_tx(
        conn: &Connection,
        mut run: ProductionRun,
        from: RunStatus,
        action: RunAction,
        actor: &str,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<ProductionRun> {
        run.revision = RunRepository::update_state_tx(conn, &run)?;
        Self::append_event_tx(conn, &run, action, Some(from), actor, detail, now)?;
        Ok(run)
    }

    fn append_event_tx(
        conn: &Connection,
        run: &ProductionRun,
        action: RunAction,
        from_status: Option<RunStatus>,
        actor: &str,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let event = RunEvent {
            event_id: Uuid::new_v4().to_string(),
            run_id: run.run_id.clone(),
            action,
            from_status,
            to_status: run.status,
            step_index: run.current_step_index,
            actor: actor.to_string(),
            detail,
            occurred_at: now,
        };
        RunRepository::insert_event_tx(conn, &event)?;
        Ok(())
    }
}
