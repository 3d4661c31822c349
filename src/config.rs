//! 执行内核配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__CONCURRENCY__DEFAULT_LIMIT=4`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub concurrency: ConcurrencySection,
    pub timeouts: TimeoutsSection,
    pub retry: RetryPolicy,
    pub recovery: RecoverySection,
    pub session: SessionSection,
    pub background: BackgroundSection,
}

/// [concurrency] 段：每个类别的槽位上限与排队超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    /// 未单独配置的类别使用此上限（最小按 1 处理）
    pub default_limit: usize,
    /// 排队等待上限（毫秒）
    pub max_wait_ms: u64,
    /// 类别 -> 上限，如 `bash = 1`
    pub limits: HashMap<String, usize>,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            default_limit: 5,
            max_wait_ms: 60_000,
            limits: HashMap::new(),
        }
    }
}

/// [timeouts] 段：全局默认与按类别默认（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub default_ms: u64,
    pub network_ms: u64,
    pub shell_ms: u64,
    pub file_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            network_ms: 60_000,
            shell_ms: 120_000,
            file_ms: 30_000,
        }
    }
}

/// [recovery] 段：按工具名覆盖恢复策略
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RecoverySection {
    /// 工具名 -> 替代工具名
    pub fallbacks: HashMap<String, String>,
    /// 失败后按空操作处理的工具
    pub skip: Vec<String>,
}

/// [session] 段：设置 db_path 时使用 SQLite，否则纯内存
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    pub db_path: Option<PathBuf>,
}

/// [background] 段：后台子智能体任务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundSection {
    /// 未指定 timeout 的任务使用此值（秒）；0 表示不限时
    pub default_timeout_secs: u64,
    /// 同时运行的后台任务数，超出的保持 pending 排队
    pub max_concurrent: usize,
    /// 事件广播通道容量
    pub event_capacity: usize,
}

impl Default for BackgroundSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 0,
            max_concurrent: 3,
            event_capacity: 256,
        }
    }
}

impl BackgroundSection {
    pub fn default_timeout(&self) -> Option<std::time::Duration> {
        (self.default_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.default_timeout_secs))
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.concurrency.default_limit, 5);
        assert_eq!(cfg.timeouts.network_ms, 60_000);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.session.db_path.is_none());
        assert!(cfg.background.default_timeout().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[concurrency]\nmax_wait_ms = 500\n[concurrency.limits]\nbash = 1\n\n[recovery]\nskip = [\"lint\"]\n\n[recovery.fallbacks]\nweb_fetch = \"web_cache\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.concurrency.max_wait_ms, 500);
        assert_eq!(cfg.concurrency.default_limit, 5);
        assert_eq!(cfg.concurrency.limits.get("bash"), Some(&1));
        assert_eq!(cfg.recovery.skip, vec!["lint".to_string()]);
        assert_eq!(
            cfg.recovery.fallbacks.get("web_fetch").map(String::as_str),
            Some("web_cache")
        );
    }
}
