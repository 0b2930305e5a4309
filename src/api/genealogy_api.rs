// ==========================================
// 生产批次追溯引擎 - 谱系查询 API
// ==========================================

use std::sync::Arc;

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::ApiResult;
use crate::domain::genealogy::{GenealogyGraph, TraceabilityView};
use crate::engine::error::EngineError;
use crate::engine::genealogy::GenealogyEngine;
use crate::engine::lot_registration::LotRegistrationService;

/// 按编码追溯时的谱系深度 (直接父/子批次)
const TRACEABILITY_DEPTH: u32 = 1;

pub struct GenealogyApi {
    engine: Arc<GenealogyEngine>,
    lots: Arc<LotRegistrationService>,
    policy: Arc<dyn RolePolicy>,
}

impl GenealogyApi {
    pub fn new(
        engine: Arc<GenealogyEngine>,
        lots: Arc<LotRegistrationService>,
        policy: Arc<dyn RolePolicy>,
    ) -> Self {
        Self {
            engine,
            lots,
            policy,
        }
    }

    /// 上游 (默认深度 1)
    pub fn parents(&self, caller: &Caller, lot_id: &str, depth: Option<u32>) -> ApiResult<GenealogyGraph> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.parents(lot_id, depth)?)
    }

    /// 下游 (默认深度 1)
    pub fn children(&self, caller: &Caller, lot_id: &str, depth: Option<u32>) -> ApiResult<GenealogyGraph> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.children(lot_id, depth)?)
    }

    /// 双向 (默认深度 3)
    pub fn tree(&self, caller: &Caller, lot_id: &str, depth: Option<u32>) -> ApiResult<GenealogyGraph> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.tree(lot_id, depth)?)
    }

    /// 按批次编码追溯: 中心批次 + 直接父/子批次
    ///
    /// # 返回
    /// - Err(NotFound): 编码不存在
    pub fn trace_by_code(&self, caller: &Caller, lot_code: &str) -> ApiResult<TraceabilityView> {
        self.policy.authorize(caller, Operation::Read)?;
        let central = self
            .lots
            .find_by_code(lot_code)?
            .ok_or_else(|| EngineError::not_found("Lot", lot_code))?;
        let graph = self.engine.tree(&central.lot_id, Some(TRACEABILITY_DEPTH))?;
        Ok(TraceabilityView::from_graph(graph))
    }
}
