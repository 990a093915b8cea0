use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/** \brief 审计事件使用的 tracing target。 */
pub const TELEMETRY_TARGET: &str = "diagramhub::telemetry";

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

/**
 * \brief 初始化全局 tracing 订阅者；RUST_LOG 优先于传入的默认过滤规则。
 * \details 重复调用是无害的，已有订阅者时直接返回。
 */
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 记录常规审计事件（仅在开关打开时输出）。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    tracing::info!(target: TELEMETRY_TARGET, category, "{}", message);
}

/**
 * \brief 记录错误审计事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    tracing::error!(target: TELEMETRY_TARGET, category, "{}", message);
}
