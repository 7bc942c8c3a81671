use tracing_subscriber::{EnvFilter, fmt};

/// 初始化 tracing 日志系统（控制台输出）
///
/// 过滤级别取自 `RUST_LOG`，未设置时使用 `default_filter`。
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // 输出到 stderr，stdout 留给接收端的文本
    let result = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    if result.is_ok() {
        tracing::info!("日志系统初始化完成");
    }
}
