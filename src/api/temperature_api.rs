// ==========================================
// 生产批次追溯引擎 - 温度记录 API
// ==========================================

use std::sync::Arc;

use chrono::Utc;

use crate::api::access::{Caller, Operation, RolePolicy};
use crate::api::error::ApiResult;
use crate::domain::temperature::{NewTemperatureLog, TemperatureLog, TemperatureLogFilter};
use crate::engine::temperature_log::TemperatureLogEngine;

pub struct TemperatureApi {
    engine: Arc<TemperatureLogEngine>,
    policy: Arc<dyn RolePolicy>,
}

impl TemperatureApi {
    pub fn new(engine: Arc<TemperatureLogEngine>, policy: Arc<dyn RolePolicy>) -> Self {
        Self { engine, policy }
    }

    /// 登记温度读数 (记录人 = 调用方)
    pub fn record(&self, caller: &Caller, input: NewTemperatureLog) -> ApiResult<TemperatureLog> {
        self.policy.authorize(caller, Operation::RecordTemperature)?;
        Ok(self.engine.record(input, &caller.user_id, Utc::now())?)
    }

    pub fn get(&self, caller: &Caller, log_id: &str) -> ApiResult<TemperatureLog> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.get(log_id)?)
    }

    pub fn list(&self, caller: &Caller, filter: TemperatureLogFilter) -> ApiResult<Vec<TemperatureLog>> {
        self.policy.authorize(caller, Operation::Read)?;
        Ok(self.engine.list(&filter)?)
    }
}
