// ==========================================
// 生产批次追溯引擎 - 批次 API
// ==========================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::{ApiError, ApiResult};
use crate::domain::lot::{GenealogyLink, Lot, LotRegistration};
use crate::engine::genealogy::GenealogyEngine;
use crate::engine::lot_registration::{LotRegistrationService, RegisteredLot};

/// 列表默认条数
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// 列表最大条数
pub const MAX_LIST_LIMIT: usize = 500;

/// 补录谱系关系请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkBody {
    pub parent_lot_id: String,
    pub child_lot_id: String,
    #[serde(default)]
    pub quantity_used_kg: Option<f64>,
}

pub struct LotApi {
    service: Arc<LotRegistrationService>,
    genealogy: Arc<GenealogyEngine>,
    policy: Arc<dyn RolePolicy>,
}

impl LotApi {
    pub fn new(
        service: Arc<LotRegistrationService>,
        genealogy: Arc<GenealogyEngine>,
        policy: Arc<dyn RolePolicy>,
    ) -> Self {
        Self {
            service,
            genealogy,
            policy,
        }
    }

    pub fn register(&self, caller: &Caller, input: LotRegistration) -> ApiResult<RegisteredLot> {
        self.policy.authorize(caller, Operation::RegisterLot)?;
        Ok(self.service.register(input, &caller.user_id, Utc::now())?)
    }

    pub fn get(&self, caller: &Caller, lot_id: &str) -> ApiResult<Lot> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.service.get(lot_id)?)
    }

    pub fn list(&self, caller: &Caller, limit: Option<usize>) -> ApiResult<Vec<Lot>> {
        self.policy.authorize(caller, Operation::Read)?;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(ApiError::InvalidInput(format!(
                "limit 必须在 1..={} 之间",
                MAX_LIST_LIMIT
            )));
        }
        Ok(self.service.list(limit)?)
    }

    pub fn link(&self, caller: &Caller, body: LinkBody) -> ApiResult<GenealogyLink> {
        self.policy.authorize(caller, Operation::LinkLots)?;
        Ok(self.genealogy.link(
            &body.parent_lot_id,
            &body.child_lot_id,
            body.quantity_used_kg,
            Utc::now(),
        )?)
    }
}
