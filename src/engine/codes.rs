// ==========================================
// 生产批次追溯引擎 - 业务编码生成
// ==========================================
// 运行编码: RUN-YYYYMMDD-SITE-####  (按日重置)
// 批次编码: <TYPE>-YYYYMMDD-####    (按日、按类型重置)
// 流水号在写事务内取当前最大值 + 1
// ==========================================

use crate::domain::types::LotType;
use crate::engine::error::{EngineError, EngineResult};
use chrono::NaiveDate;

pub fn run_code_prefix(date: NaiveDate, site_code: &str) -> String {
    format!("RUN-{}-{}-", date.format("%Y%m%d"), site_code)
}

pub fn lot_code_prefix(date: NaiveDate, lot_type: LotType) -> String {
    format!("{}-{}-", lot_type.to_db_str(), date.format("%Y%m%d"))
}

pub fn with_sequence(prefix: &str, sequence: u32) -> String {
    format!("{}{:04}", prefix, sequence)
}

/// 自动编号上限 (与仓储层可识别的最大位数一致)
pub const MAX_SEQUENCE: u32 = 999_999;

/// 当前最大流水号 + 1
pub fn next_sequence(prefix: &str, current_max: u32) -> EngineResult<u32> {
    current_max
        .checked_add(1)
        .filter(|next| *next <= MAX_SEQUENCE)
        .ok_or_else(|| EngineError::Storage(format!("编码前缀 {} 的流水号已耗尽", prefix)))
}
