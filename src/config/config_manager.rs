// ==========================================
// 生产批次追溯引擎 - 配置管理器
// ==========================================
// 职责: 引擎参数加载、查询、覆写
// 存储: config_kv 表 (key-value + scope)
// 规则: 缺失或格式错误的配置回落到默认值,格式错误记录 warn
// ==========================================

use crate::db::{configure_sqlite_connection, lock_connection, SharedConnection};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{FixedOffset, Offset, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::MutexGuard;
use std::time::Duration;

const GLOBAL_SCOPE: &str = "global";

// 配置读取本身使用固定超时,避免依赖尚未加载的 storage_timeout_ms
const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ==========================================
// EngineSettings - 引擎参数快照
// ==========================================
// 启动时加载一次,引擎持有只读副本
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub min_accountability_text_len: usize, // 暂停/恢复/中止/质检说明最短长度
    pub max_notes_len: usize,               // 推进备注最大长度
    pub genealogy_max_depth: u32,           // 单向谱系查询最大深度
    pub genealogy_tree_max_depth: u32,      // 双向谱系树最大深度
    pub site_code: String,                  // 运行编码中的站点代码
    pub storage_timeout_ms: u64,            // 存储访问超时
    pub compliance_utc_offset_minutes: i32, // 同日规则使用的时区偏移
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_accountability_text_len: 10,
            max_notes_len: 500,
            genealogy_max_depth: 10,
            genealogy_tree_max_depth: 5,
            site_code: "DUNA".to_string(),
            storage_timeout_ms: 5_000,
            compliance_utc_offset_minutes: 0,
        }
    }
}

impl EngineSettings {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// 同日规则的时区偏移 (非法偏移回落 UTC)
    pub fn compliance_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.compliance_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: SharedConnection,
}

impl ConfigManager {
    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: SharedConnection) -> RepositoryResult<Self> {
        {
            let guard = lock_connection(&conn, CONFIG_LOCK_TIMEOUT)?;
            configure_sqlite_connection(&guard)?;
        }
        Ok(Self { conn })
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn, CONFIG_LOCK_TIMEOUT)
    }

    /// 读取 global scope 的配置值
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_global_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = ?1 AND key = ?2",
                params![GLOBAL_SCOPE, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global scope 的配置值 (存在则覆写)
    pub fn set_global_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        if key.trim().is_empty() {
            return Err(RepositoryError::ValidationError("配置键不能为空".to_string()));
        }
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(scope_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![
                GLOBAL_SCOPE,
                key,
                value,
                Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
            ],
        )?;
        Ok(())
    }

    /// 获取所有 global 配置的快照
    pub fn get_config_snapshot(&self) -> RepositoryResult<BTreeMap<String, String>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![GLOBAL_SCOPE], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            snapshot.insert(key, value);
        }
        Ok(snapshot)
    }

    /// 加载引擎参数快照
    pub fn load_settings(&self) -> RepositoryResult<EngineSettings> {
        let defaults = EngineSettings::default();

        let settings = EngineSettings {
            min_accountability_text_len: self.parse_or_default(
                config_keys::MIN_ACCOUNTABILITY_TEXT_LEN,
                defaults.min_accountability_text_len,
                |v: &usize| *v > 0,
            )?,
            max_notes_len: self.parse_or_default(
                config_keys::MAX_NOTES_LEN,
                defaults.max_notes_len,
                |v: &usize| *v > 0,
            )?,
            genealogy_max_depth: self.parse_or_default(
                config_keys::GENEALOGY_MAX_DEPTH,
                defaults.genealogy_max_depth,
                |v: &u32| *v >= 1,
            )?,
            genealogy_tree_max_depth: self.parse_or_default(
                config_keys::GENEALOGY_TREE_MAX_DEPTH,
                defaults.genealogy_tree_max_depth,
                |v: &u32| *v >= 1,
            )?,
            site_code: self.parse_or_default(
                config_keys::SITE_CODE,
                defaults.site_code.clone(),
                |v: &String| {
                    !v.is_empty() && v.chars().all(|c| c.is_ascii_alphanumeric())
                },
            )?,
            storage_timeout_ms: self.parse_or_default(
                config_keys::STORAGE_TIMEOUT_MS,
                defaults.storage_timeout_ms,
                |v: &u64| *v > 0,
            )?,
            compliance_utc_offset_minutes: self.parse_or_default(
                config_keys::COMPLIANCE_UTC_OFFSET_MINUTES,
                defaults.compliance_utc_offset_minutes,
                |v: &i32| (-14 * 60..=14 * 60).contains(v),
            )?,
        };

        tracing::debug!(?settings, "引擎参数已加载");
        Ok(settings)
    }

    fn parse_or_default<T, F>(&self, key: &str, default: T, valid: F) -> RepositoryResult<T>
    where
        T: FromStr,
        F: Fn(&T) -> bool,
    {
        let Some(raw) = self.get_global_config_value(key)? else {
            return Ok(default);
        };

        match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => Ok(value),
            _ => {
                tracing::warn!(config_key = key, raw_value = %raw, "配置值格式错误，使用默认值");
                Ok(default)
            }
        }
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 责任说明
    pub const MIN_ACCOUNTABILITY_TEXT_LEN: &str = "min_accountability_text_len";
    pub const MAX_NOTES_LEN: &str = "max_notes_len";

    // 谱系
    pub const GENEALOGY_MAX_DEPTH: &str = "genealogy_max_depth";
    pub const GENEALOGY_TREE_MAX_DEPTH: &str = "genealogy_tree_max_depth";

    // 编码
    pub const SITE_CODE: &str = "site_code";

    // 存储
    pub const STORAGE_TIMEOUT_MS: &str = "storage_timeout_ms";

    // 合规
    pub const COMPLIANCE_UTC_OFFSET_MINUTES: &str = "compliance_utc_offset_minutes";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_shared;

    #[test]
    fn test_defaults_when_empty() {
        let manager = ConfigManager::from_connection(open_in_memory_shared().unwrap()).unwrap();
        assert_eq!(manager.load_settings().unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_override_and_malformed_fallback() {
        let manager = ConfigManager::from_connection(open_in_memory_shared().unwrap()).unwrap();
        manager
            .set_global_config_value(config_keys::SITE_CODE, "ZGB")
            .unwrap();
        manager
            .set_global_config_value(config_keys::GENEALOGY_MAX_DEPTH, "abc")
            .unwrap();
        manager
            .set_global_config_value(config_keys::COMPLIANCE_UTC_OFFSET_MINUTES, "60")
            .unwrap();

        let settings = manager.load_settings().unwrap();
        assert_eq!(settings.site_code, "ZGB");
        assert_eq!(settings.genealogy_max_depth, 10);
        assert_eq!(settings.compliance_offset().local_minus_utc(), 3600);

        let snapshot = manager.get_config_snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_out_of_range_offset_falls_back() {
        let manager = ConfigManager::from_connection(open_in_memory_shared().unwrap()).unwrap();
        manager
            .set_global_config_value(config_keys::COMPLIANCE_UTC_OFFSET_MINUTES, "10000")
            .unwrap();
        assert_eq!(
            manager.load_settings().unwrap().compliance_utc_offset_minutes,
            0
        );
    }
}
