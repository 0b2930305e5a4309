// ==========================================
// 生产批次追溯引擎 - 质检领域模型
// ==========================================
// 红线: 质检结论创建后不可修改,更正 = 追加新结论
// ==========================================

use crate::domain::types::{Decision, GateType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcGate {
    pub gate_id: String,
    pub gate_code: String,
    pub name: String,
    pub gate_type: GateType,
    pub is_ccp: bool, // 关键控制点
}

impl QcGate {
    pub fn is_blocking(&self) -> bool {
        self.gate_type == GateType::Blocking
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcDecision {
    pub decision_id: String,
    pub lot_id: String,
    pub gate_id: String,
    pub operator_id: String,
    pub decision: Decision,
    pub notes: Option<String>,
    pub temperature_c: Option<f64>,       // 复核温度
    pub digital_signature: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// 质检结论登记请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQcDecision {
    pub lot_id: String,
    pub gate_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub digital_signature: Option<String>,
}
