// ==========================================
// 生产批次追溯引擎 - 质检 API
// ==========================================

use std::sync::Arc;

use chrono::Utc;

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::ApiResult;
use crate::domain::qc::{NewQcDecision, QcDecision, QcGate};
use crate::engine::qc_gate::QcGateEngine;

pub struct QcApi {
    engine: Arc<QcGateEngine>,
    policy: Arc<dyn RolePolicy>,
}

impl QcApi {
    pub fn new(engine: Arc<QcGateEngine>, policy: Arc<dyn RolePolicy>) -> Self {
        Self { engine, policy }
    }

    /// 记录质检结论 (质检员 = 调用方)
    pub fn record_decision(&self, caller: &Caller, input: NewQcDecision) -> ApiResult<QcDecision> {
        self.policy.authorize(caller, Operation::RecordQcDecision)?;
        Ok(self.engine.record_decision(input, &caller.user_id, Utc::now())?)
    }

    pub fn latest_decision(
        &self,
        caller: &Caller,
        lot_id: &str,
        gate_id: &str,
    ) -> ApiResult<Option<QcDecision>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.latest_decision(lot_id, gate_id)?)
    }

    pub fn history(&self, caller: &Caller, lot_id: &str) -> ApiResult<Vec<QcDecision>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.history(lot_id)?)
    }

    pub fn list_gates(&self, caller: &Caller) -> ApiResult<Vec<QcGate>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.list_gates()?)
    }
}
