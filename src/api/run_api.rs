// ==========================================
// 生产批次追溯引擎 - 生产运行 API
// ==========================================
// 职责: 授权 + 入参整理,委托 RunLifecycleEngine
// ==========================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::{ApiError, ApiResult};
use crate::db::CANONICAL_FLOW_VERSION_ID;
use crate::domain::buffer::BufferInventory;
use crate::domain::run::{ProductionRun, RunEvent, RunStepExecution};
use crate::domain::types::RunStatus;
use crate::engine::run_lifecycle::{
    AdvanceOutcome, CreateOutcome, CreateRunRequest, RunLifecycleEngine,
};

/// 创建运行请求体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRunBody {
    #[serde(default)]
    pub flow_version_id: Option<String>, // 为空使用标准工艺
    #[serde(default)]
    pub daily_target_kg: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvanceBody {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expected_step_index: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionBody {
    #[serde(default)]
    pub resolution: Option<String>,
}

// ==========================================
// RunApi - 生产运行 API
// ==========================================
pub struct RunApi {
    engine: Arc<RunLifecycleEngine>,
    policy: Arc<dyn RolePolicy>,
}

impl RunApi {
    pub fn new(engine: Arc<RunLifecycleEngine>, policy: Arc<dyn RolePolicy>) -> Self {
        Self { engine, policy }
    }

    /// 创建运行
    ///
    /// # 参数
    /// - idempotency_key: 请求头 Idempotency-Key (必填)
    pub fn create(
        &self,
        caller: &Caller,
        idempotency_key: Option<&str>,
        body: CreateRunBody,
    ) -> ApiResult<CreateOutcome> {
        self.policy.authorize(caller, Operation::CreateRun)?;
        let key = idempotency_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApiError::InvalidInput("缺少 Idempotency-Key 请求头".to_string()))?;

        let req = CreateRunRequest {
            flow_version_id: body
                .flow_version_id
                .unwrap_or_else(|| CANONICAL_FLOW_VERSION_ID.to_string()),
            idempotency_key: key.to_string(),
            daily_target_kg: body.daily_target_kg,
        };
        Ok(self.engine.create(req, &caller.user_id, Utc::now())?)
    }

    pub fn get(&self, caller: &Caller, run_id: &str) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.get(run_id)?)
    }

    /// 运行列表; status_filter 为状态名 (大小写不敏感)
    pub fn list(&self, caller: &Caller, status_filter: Option<&str>) -> ApiResult<Vec<ProductionRun>> {
        self.policy.authorize(caller, Operation::Read)?;
        let status = match status_filter.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                RunStatus::from_db_str(raw)
                    .ok_or_else(|| ApiError::InvalidInput(format!("未知运行状态: {}", raw)))?,
            ),
            None => None,
        };
        Ok(self.engine.list(status)?)
    }

    pub fn steps(&self, caller: &Caller, run_id: &str) -> ApiResult<Vec<RunStepExecution>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.steps(run_id)?)
    }

    pub fn buffers(&self, caller: &Caller, run_id: &str) -> ApiResult<Vec<BufferInventory>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.buffers(run_id)?)
    }

    pub fn events(&self, caller: &Caller, run_id: &str) -> ApiResult<Vec<RunEvent>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.events(run_id)?)
    }

    // ==========================================
    // 状态迁移
    // ==========================================

    pub fn start(&self, caller: &Caller, run_id: &str) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::StartRun)?;
        Ok(self.engine.start(run_id, &caller.user_id, Utc::now())?)
    }

    pub fn advance(&self, caller: &Caller, run_id: &str, body: AdvanceBody) -> ApiResult<AdvanceOutcome> {
        self.policy.authorize(caller, Operation::AdvanceRun)?;
        Ok(self.engine.advance(
            run_id,
            body.notes.as_deref(),
            body.expected_step_index,
            &caller.user_id,
            Utc::now(),
        )?)
    }

    pub fn hold(&self, caller: &Caller, run_id: &str, body: ReasonBody) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::HoldRun)?;
        Ok(self
            .engine
            .hold(run_id, body.reason.as_deref(), &caller.user_id, Utc::now())?)
    }

    pub fn resume(&self, caller: &Caller, run_id: &str, body: ResolutionBody) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::ResumeRun)?;
        Ok(self
            .engine
            .resume(run_id, body.resolution.as_deref(), &caller.user_id, Utc::now())?)
    }

    pub fn complete(&self, caller: &Caller, run_id: &str) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::CompleteRun)?;
        Ok(self.engine.complete(run_id, &caller.user_id, Utc::now())?)
    }

    pub fn abort(&self, caller: &Caller, run_id: &str, body: ReasonBody) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::AbortRun)?;
        Ok(self
            .engine
            .abort(run_id, body.reason.as_deref(), &caller.user_id, Utc::now())?)
    }

    pub fn archive(&self, caller: &Caller, run_id: &str) -> ApiResult<ProductionRun> {
        self.policy.authorize(caller, Operation::ArchiveRun)?;
        Ok(self.engine.archive(run_id, &caller.user_id, Utc::now())?)
    }
}
