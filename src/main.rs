// ==========================================
// 生产批次追溯引擎 - HTTP 服务主入口
// ==========================================
// 环境变量:
// - HACCP_TRACE_DB_PATH: 数据库路径 (默认用户数据目录)
// - HACCP_TRACE_BIND: 监听地址 (默认 127.0.0.1:8080)
// - RUST_LOG: 日志级别
// - HACCP_TRACE_LOG_FORMAT: json 时输出结构化日志
// ==========================================

use anyhow::Context;
use haccp_trace::app::{get_default_db_path, serve, AppState};
use haccp_trace::logging;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{}", haccp_trace::APP_NAME);
    tracing::info!("系统版本: {}", haccp_trace::VERSION);
    tracing::info!("==================================================");

    let db_path = get_default_db_path();
    tracing::info!("使用数据库: {}", db_path);

    let state = AppState::new(db_path)
        .map_err(anyhow::Error::msg)
        .context("无法初始化AppState")?;

    let bind_addr = std::env::var("HACCP_TRACE_BIND")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

    serve(state, &bind_addr)
        .await
        .with_context(|| format!("HTTP 服务异常退出: {}", bind_addr))?;

    Ok(())
}
