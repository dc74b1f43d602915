//! 脚本化 RPC 客户端（用于测试与离线演示，无需渗透服务）
//!
//! 按顺序弹出预置响应；队列耗尽后返回 Value::Null，同时记录收到的请求。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::rpc::{ModuleExecuteRequest, RpcClient, RpcError};

/// 预置响应的 Mock 客户端
#[derive(Debug, Default)]
pub struct ScriptedRpcClient {
    responses: Mutex<VecDeque<Result<Value, RpcError>>>,
    requests: Mutex<Vec<ModuleExecuteRequest>>,
}

impl ScriptedRpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = Result<Value, RpcError>>) -> Self {
        let client = Self::new();
        for r in responses {
            client.push(r);
        }
        client
    }

    pub fn push(&self, response: Result<Value, RpcError>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(response);
        }
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<ModuleExecuteRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RpcClient for ScriptedRpcClient {
    async fn module_execute(&self, request: &ModuleExecuteRequest) -> Result<Value, RpcError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(Ok(Value::Null))
    }
}
