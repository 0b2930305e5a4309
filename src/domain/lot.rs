// ==========================================
// 生产批次追溯引擎 - 批次领域模型
// ==========================================
// 红线: 批次编码全局唯一且不可变; 批次只追加不删除
// 红线: 修正 = 新批次 + 新谱系关系,不修改历史记录
// ==========================================

use crate::domain::types::LotType;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// Lot - 批次
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: String,              // 批次ID
    pub lot_code: String,            // 批次编码 (唯一,不可变)
    pub lot_type: LotType,           // 批次类型
    pub run_id: Option<String>,      // 所属生产运行
    pub step_index: Option<i32>,     // 所在工序序号
    pub weight_kg: Option<f64>,      // 重量 (kg)
    pub temperature_c: Option<f64>,  // 温度 (°C)
    pub metadata: JsonValue,         // 自由元数据
    pub operator_id: Option<String>, // 登记人
    pub created_at: DateTime<Utc>,   // 创建时间 (UTC)
}

impl Lot {
    /// 按给定时区偏移计算批次的生产日期
    pub fn production_date(&self, offset: FixedOffset) -> NaiveDate {
        self.created_at.with_timezone(&offset).date_naive()
    }
}

// ==========================================
// GenealogyLink - 谱系关系 (父 → 子)
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenealogyLink {
    pub link_id: String,
    pub parent_lot_id: String,
    pub child_lot_id: String,
    pub quantity_used_kg: Option<f64>, // 消耗量 (kg)
    pub linked_at: DateTime<Utc>,
}

// ==========================================
// LotRegistration - 批次登记请求
// ==========================================
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentDeclaration {
    pub lot_id: String,
    #[serde(default)]
    pub quantity_used_kg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotRegistration {
    #[serde(default)]
    pub lot_code: Option<String>, // 为空时自动生成
    pub lot_type: LotType,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub step_index: Option<i32>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub parents: Vec<ParentDeclaration>,
}

impl LotRegistration {
    pub fn new(lot_type: LotType) -> Self {
        Self {
            lot_code: None,
            lot_type,
            run_id: None,
            step_index: None,
            weight_kg: None,
            temperature_c: None,
            metadata: None,
            parents: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_production_date_respects_offset() {
        let lot = Lot {
            lot_id: "L1".to_string(),
            lot_code: "MIX-20260118-0001".to_string(),
            lot_type: LotType::FinalMix,
            run_id: None,
            step_index: None,
            weight_kg: Some(10.0),
            temperature_c: None,
            metadata: JsonValue::Null,
            operator_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 18, 23, 30, 0).unwrap(),
        };

        let utc = FixedOffset::east_opt(0).unwrap();
        let cet = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(
            lot.production_date(utc),
            NaiveDate::from_ymd_opt(2026, 1, 18).unwrap()
        );
        assert_eq!(
            lot.production_date(cet),
            NaiveDate::from_ymd_opt(2026, 1, 19).unwrap()
        );
    }
}
