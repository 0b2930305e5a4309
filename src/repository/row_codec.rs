// ==========================================
// 生产批次追溯引擎 - 行映射辅助
// ==========================================
// 时间戳统一以 UTC 文本存储,精确到微秒 (保证同一秒内结论的先后顺序)
// 枚举列解析失败一律视为数据损坏,不做静默降级
// ==========================================

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_ts)
}

/// 解析时间戳列 (兼容不带小数秒的旧格式)
pub fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// 解析封闭枚举列
pub fn parse_enum<T>(idx: usize, raw: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("未知枚举值: {}", raw).into(),
        )
    })
}

pub fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// 业务编码流水号最大位数 (超出视为手工编码,不参与自动编号)
pub const MAX_SEQUENCE_DIGITS: usize = 6;

/// 从 `<prefix><digits>` 形式的编码中取出流水号
pub fn parse_code_sequence(code: &str, prefix: &str) -> Option<u32> {
    let suffix = code.strip_prefix(prefix)?;
    if suffix.is_empty()
        || suffix.len() > MAX_SEQUENCE_DIGITS
        || !suffix.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    suffix.parse().ok()
}
