// ==========================================
// 生产批次追溯引擎 - 温度记录领域模型
// ==========================================
// 红线: 温度记录只追加; 是否超限由服务端按测量类型阈值判定
// ==========================================

use crate::domain::types::MeasurementType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 可接受的温度读数范围 (°C)
pub const MIN_READING_C: f64 = -50.0;
pub const MAX_READING_C: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureLog {
    pub log_id: String,
    pub measurement_type: MeasurementType,
    pub temperature_c: f64,
    pub lot_id: Option<String>,    // 关联批次
    pub buffer_id: Option<String>, // 关联缓冲区
    pub is_violation: bool,        // 超出阈值
    pub recorded_by: String,
    pub recorded_at: DateTime<Utc>,
}

/// 温度记录登记请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemperatureLog {
    pub measurement_type: MeasurementType,
    pub temperature_c: f64,
    #[serde(default)]
    pub lot_id: Option<String>,
    #[serde(default)]
    pub buffer_id: Option<String>,
}

/// 温度记录查询条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemperatureLogFilter {
    #[serde(default)]
    pub lot_id: Option<String>,
    #[serde(default)]
    pub buffer_id: Option<String>,
    #[serde(default)]
    pub violations_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}
