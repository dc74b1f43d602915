//! HTTP JSON 传输：POST {url}，body 为 JSON-RPC 2.0 请求，取响应中的 result 字段

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::rpc::{ModuleExecuteRequest, RpcClient, RpcError, METHOD_MODULE_EXECUTE};

/// 基于 reqwest 的渗透服务客户端
pub struct HttpRpcClient {
    client: Client,
    url: String,
    token: Option<String>,
    /// 请求超时（秒），同步调用时会按请求的 timeout 放宽
    request_timeout_secs: u64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, token: Option<String>, request_timeout_secs: u64) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            token,
            request_timeout_secs,
        }
    }

    fn effective_timeout(&self, request: &ModuleExecuteRequest) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(request.timeout_secs))
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn module_execute(&self, request: &ModuleExecuteRequest) -> Result<Value, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": METHOD_MODULE_EXECUTE,
            "params": request.to_params(),
        });

        let mut req = self
            .client
            .post(&self.url)
            .timeout(self.effective_timeout(request))
            .json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(self.effective_timeout(request).as_secs())
            } else {
                RpcError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            tracing::warn!(error = %err, "RPC returned error object");
            return Ok(Value::Null);
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}
