// ==========================================
// 生产批次追溯引擎 - 缓冲区 API
// ==========================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::ApiResult;
use crate::domain::buffer::{BufferInventory, BufferInventoryEntry, BufferSummary};
use crate::engine::buffer_inventory::{BufferInventoryManager, TransferOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceLotBody {
    pub lot_id: String,
    pub quantity_kg: f64,
    #[serde(default)]
    pub temperature_c: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBody {
    pub from_buffer_id: String,
    pub to_buffer_id: String,
    pub lot_id: String,
    #[serde(default)]
    pub quantity_kg: Option<f64>, // 为空 = 全部转出
}

/// 出库结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOutcome {
    pub buffer_id: String,
    pub lot_id: String,
    pub removed: bool, // false = 批次本不在库
}

pub struct BufferApi {
    manager: Arc<BufferInventoryManager>,
    policy: Arc<dyn RolePolicy>,
}

impl BufferApi {
    pub fn new(manager: Arc<BufferInventoryManager>, policy: Arc<dyn RolePolicy>) -> Self {
        Self { manager, policy }
    }

    pub fn list(&self, caller: &Caller) -> ApiResult<Vec<BufferSummary>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.manager.list_buffers()?)
    }

    pub fn inventory(&self, caller: &Caller, buffer_id: &str) -> ApiResult<BufferInventory> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.manager.inventory(buffer_id)?)
    }

    pub fn place_lot(
        &self,
        caller: &Caller,
        buffer_id: &str,
        body: PlaceLotBody,
    ) -> ApiResult<BufferInventoryEntry> {
        self.policy.authorize(caller, Operation::MoveBuffer)?;
        Ok(self.manager.place_lot(
            buffer_id,
            &body.lot_id,
            body.quantity_kg,
            body.temperature_c,
            Utc::now(),
        )?)
    }

    pub fn remove_lot(&self, caller: &Caller, buffer_id: &str, lot_id: &str) -> ApiResult<RemoveOutcome> {
        self.policy.authorize(caller, Operation::MoveBuffer)?;
        let removed = self.manager.remove_lot(buffer_id, lot_id, Utc::now())?;
        Ok(RemoveOutcome {
            buffer_id: buffer_id.to_string(),
            lot_id: lot_id.to_string(),
            removed,
        })
    }

    pub fn transfer(&self, caller: &Caller, body: TransferBody) -> ApiResult<TransferOutcome> {
        self.policy.authorize(caller, Operation::MoveBuffer)?;
        Ok(self.manager.transfer(
            &body.from_buffer_id,
            &body.to_buffer_id,
            &body.lot_id,
            body.quantity_kg,
            Utc::now(),
        )?)
    }
}
