//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MODEXEC__*` 覆盖（双下划线表示嵌套，如 `MODEXEC__RPC__URL=http://...`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub rpc: RpcSection,
    pub registry: RegistrySection,
    pub history: HistorySection,
    pub worker: WorkerSection,
}

/// [rpc] 段：渗透服务地址、鉴权与超时
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSection {
    #[serde(default = "default_rpc_url")]
    pub url: String,
    pub token: Option<String>,
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 同步执行模块的默认超时（秒）
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    /// 同步执行时本地在远端超时之外多等待的秒数
    #[serde(default = "default_timeout_grace")]
    pub timeout_grace_secs: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:60005/api/v1/msgrpc".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_sync_timeout() -> u64 {
    1800
}

fn default_timeout_grace() -> u64 {
    5
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
            sync_timeout_secs: default_sync_timeout(),
            timeout_grace_secs: default_timeout_grace(),
        }
    }
}

/// [registry] 段：无回调任务的回收策略；stale_after_secs = 0 表示不回收
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_stale_after() -> u64 {
    86_400
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// [history] 段：memory / jsonl / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_history_backend")]
    pub backend: String,
    pub path: Option<PathBuf>,
}

fn default_history_backend() -> String {
    "memory".to_string()
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            backend: default_history_backend(),
            path: None,
        }
    }
}

/// [worker] 段：定时任务通道的本地并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MODEXEC__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MODEXEC__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("MODEXEC")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
