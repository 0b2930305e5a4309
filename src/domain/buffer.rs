// ==========================================
// 生产批次追溯引擎 - 缓冲区领域模型
// ==========================================
// 缓冲区为静态配置; 库存条目随批次进出而创建/关闭
// ==========================================

use crate::domain::types::LotType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 容量比较容差 (kg),吸收浮点累加误差
pub const CAPACITY_EPSILON_KG: f64 = 1e-6;

// ==========================================
// Buffer - 缓冲区
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub buffer_id: String,
    pub buffer_code: String,               // 唯一编码 (如 LK-001)
    pub buffer_type: String,               // 类型标签
    pub allowed_lot_types: Vec<LotType>,   // 允许的批次类型
    pub capacity_kg: f64,                  // 容量 (kg)
    pub temp_min_c: Option<f64>,           // 最低温度
    pub temp_max_c: Option<f64>,           // 最高温度
    pub is_active: bool,
}

impl Buffer {
    pub fn accepts(&self, lot_type: LotType) -> bool {
        self.allowed_lot_types.contains(&lot_type)
    }

    /// 温度是否在 [temp_min, temp_max] 区间内 (未配置的边界不做限制)
    pub fn temperature_in_range(&self, temperature_c: f64) -> bool {
        let above_min = self.temp_min_c.map_or(true, |min| temperature_c >= min);
        let below_max = self.temp_max_c.map_or(true, |max| temperature_c <= max);
        above_min && below_max
    }

    /// 当前存量加上新增量后是否超出容量
    pub fn would_overflow(&self, current_kg: f64, incoming_kg: f64) -> bool {
        current_kg + incoming_kg > self.capacity_kg + CAPACITY_EPSILON_KG
    }
}

// ==========================================
// BufferInventoryEntry - 库存条目
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferInventoryEntry {
    pub entry_id: String,
    pub buffer_id: String,
    pub lot_id: String,
    pub run_id: Option<String>,
    pub quantity_kg: f64,
    pub temperature_c: Option<f64>, // 入库温度快照
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>, // 为空表示仍在库
}

// ==========================================
// BufferInventory - 缓冲区当前库存
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferInventory {
    pub buffer: Buffer,
    pub entries: Vec<BufferInventoryEntry>,
    pub total_quantity_kg: f64,
    pub item_count: usize,
}

impl BufferInventory {
    pub fn new(buffer: Buffer, entries: Vec<BufferInventoryEntry>) -> Self {
        let total_quantity_kg = entries.iter().map(|e| e.quantity_kg).sum();
        let item_count = entries.len();
        Self {
            buffer,
            entries,
            total_quantity_kg,
            item_count,
        }
    }

    pub fn remaining_capacity_kg(&self) -> f64 {
        (self.buffer.capacity_kg - self.total_quantity_kg).max(0.0)
    }

    /// 利用率 (百分比)
    pub fn utilization_pct(&self) -> f64 {
        if self.buffer.capacity_kg <= 0.0 {
            return 0.0;
        }
        self.total_quantity_kg / self.buffer.capacity_kg * 100.0
    }
}

/// 缓冲区汇总 (列表视图用)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSummary {
    pub buffer: Buffer,
    pub total_quantity_kg: f64,
    pub item_count: usize,
    pub utilization_pct: f64,
}

impl From<&BufferInventory> for BufferSummary {
    fn from(inv: &BufferInventory) -> Self {
        Self {
            buffer: inv.buffer.clone(),
            total_quantity_kg: inv.total_quantity_kg,
            item_count: inv.item_count,
            utilization_pct: inv.utilization_pct(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chiller() -> Buffer {
        Buffer {
            buffer_id: "B1".to_string(),
            buffer_code: "LK-001".to_string(),
            buffer_type: "LK".to_string(),
            allowed_lot_types: vec![LotType::Deboned, LotType::BulkMix],
            capacity_kg: 1000.0,
            temp_min_c: Some(1.0),
            temp_max_c: Some(4.0),
            is_active: true,
        }
    }

    #[test]
    fn test_capacity_boundary() {
        let buffer = chiller();
        assert!(!buffer.would_overflow(600.0, 400.0));
        assert!(buffer.would_overflow(600.0, 401.0));
        // 浮点累加误差不应误判
        assert!(!buffer.would_overflow(0.1 + 0.2, 999.7));
    }

    #[test]
    fn test_temperature_range_inclusive() {
        let buffer = chiller();
        assert!(buffer.temperature_in_range(1.0));
        assert!(buffer.temperature_in_range(4.0));
        assert!(!buffer.temperature_in_range(4.1));
        assert!(!buffer.temperature_in_range(0.9));
    }

    #[test]
    fn test_inventory_totals() {
        let inv = BufferInventory::new(chiller(), vec![]);
        assert_eq!(inv.total_quantity_kg, 0.0);
        assert_eq!(inv.remaining_capacity_kg(), 1000.0);
        assert_eq!(inv.utilization_pct(), 0.0);
    }
}
