//! 渗透服务 RPC 抽象
//!
//! 只定义本引擎需要的 module.execute 调用；传输实现（HTTP JSON / Mock）实现 RpcClient。

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use http::HttpRpcClient;
pub use mock::ScriptedRpcClient;

/// 渗透服务在 license 过期时返回的哨兵字符串
pub const LICENSE_EXPIRED_SENTINEL: &str = "license expire";

/// RPC 方法名
pub const METHOD_MODULE_EXECUTE: &str = "module.execute";

/// RPC 传输层错误
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("RPC timeout after {0}s")]
    Timeout(u64),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Response decode failed: {0}")]
    Decode(String),
}

/// module.execute 请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleExecuteRequest {
    pub op_type: String,
    pub module_name: String,
    pub params: Map<String, Value>,
    /// 是否以后台 job 运行
    pub run_as_job: bool,
    /// 远端超时（秒），0 表示由渗透服务自行决定
    pub timeout_secs: u64,
}

impl ModuleExecuteRequest {
    /// 位置参数形式：[type, name, opts, runasjob, timeout]
    pub fn to_params(&self) -> Value {
        Value::Array(vec![
            Value::from(self.op_type.clone()),
            Value::from(self.module_name.clone()),
            Value::Object(self.params.clone()),
            Value::from(self.run_as_job),
            Value::from(self.timeout_secs),
        ])
    }
}

/// 渗透服务客户端：返回解码后的原始结果；服务端返回 null 时为 Value::Null
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn module_execute(&self, request: &ModuleExecuteRequest) -> Result<Value, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_params() {
        let mut params = Map::new();
        params.insert("SESSION".into(), Value::from(1));
        let req = ModuleExecuteRequest {
            op_type: "post".into(),
            module_name: "multi/gather/info".into(),
            params,
            run_as_job: true,
            timeout_secs: 0,
        };
        assert_eq!(
            req.to_params(),
            serde_json::json!(["post", "multi/gather/info", {"SESSION": 1}, true, 0])
        );
    }
}
