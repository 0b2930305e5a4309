// ==========================================
// 生产批次追溯引擎 - 责任说明文本规则
// ==========================================
// 暂停原因 / 恢复说明 / 中止原因 / 质检 HOLD·FAIL 说明共用同一最短长度
// 长度按去除首尾空白后的字符数计算
// ==========================================

use crate::engine::error::{EngineError, EngineResult};

/// 校验必填的责任说明,返回去除首尾空白后的文本
pub fn require_text(field: &str, text: Option<&str>, min_len: usize) -> EngineResult<String> {
    let trimmed = text.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return Err(EngineError::validation(field, format!("{}不能为空", field)));
    }
    let len = trimmed.chars().count();
    if len < min_len {
        return Err(EngineError::validation(
            field,
            format!("{}至少需要 {} 个字符 (当前 {})", field, min_len, len),
        ));
    }
    Ok(trimmed.to_string())
}

/// 校验可选备注的最大长度,空白备注视为未填写
pub fn optional_text(field: &str, text: Option<&str>, max_len: usize) -> EngineResult<Option<String>> {
    let Some(trimmed) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(EngineError::validation(
            field,
            format!("{}不能超过 {} 个字符 (当前 {})", field, max_len, len),
        ));
    }
    Ok(Some(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_length_boundary() {
        assert!(require_text("reason", Some("123456789"), 10).is_err());
        assert_eq!(
            require_text("reason", Some("1234567890"), 10).unwrap(),
            "1234567890"
        );
        // 首尾空白不计入长度
        assert!(require_text("reason", Some("   123456789   "), 10).is_err());
        assert!(require_text("reason", None, 10).is_err());
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        // 10 个汉字 = 10 个字符
        assert!(require_text("reason", Some("冷链温度超标需要复检"), 10).is_ok());
        assert!(require_text("reason", Some("冷链温度超标需复检"), 10).is_err());
        assert!(require_text("reason", Some("收货温度超标需整批退回"), 10).is_ok());
    }

    #[test]
    fn test_optional_max_length() {
        assert_eq!(optional_text("notes", Some("  "), 5).unwrap(), None);
        assert_eq!(optional_text("notes", Some("ok"), 5).unwrap(), Some("ok".to_string()));
        assert!(optional_text("notes", Some("toolong"), 5).is_err());
    }
}
