// ==========================================
// 生产批次追溯引擎 - 日志初始化
// ==========================================
// 过滤: RUST_LOG,缺省只放行本 crate 与 HTTP 追踪层的 info
// 格式: HACCP_TRACE_LOG_FORMAT=json 输出结构化 JSON 行,否则为文本
// ==========================================

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FORMAT_ENV: &str = "HACCP_TRACE_LOG_FORMAT";
const DEFAULT_DIRECTIVES: &str = "haccp_trace=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json, // 供日志采集 (审计留存)
}

impl LogFormat {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// 服务进程日志 (只能调用一次)
pub fn init() {
    let builder = fmt().with_env_filter(env_filter()).with_target(true);
    match LogFormat::from_env() {
        LogFormat::Json => builder.json().with_current_span(false).init(),
        LogFormat::Text => builder.with_line_number(true).init(),
    }
}

/// 测试日志: debug 级别写入测试捕获器,重复调用无副作用
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("haccp_trace=debug"))
        .with_test_writer()
        .try_init();
}
