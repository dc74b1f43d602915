//! 模块实例（Operation Descriptor）
//!
//! 每个后渗透模块实现 Operation trait：身份信息（OperationSpec）、前置检查 check、
//! 结果回调 callback、输出缓冲 OperationOutput。提交后实例以 OperationHandle 形式
//! 只被登记表持有，回调到达时取出并调用。

pub mod catalog;
pub mod raw;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::notice::NoticeLevel;

pub use catalog::{OperationCatalog, OperationFactory, OperationMeta};
pub use raw::RawModuleOperation;

/// 共享的模块实例；单实例的锁只在调用该实例时持有，不会串行化其他模块
pub type OperationHandle = Arc<Mutex<dyn Operation>>;

/// 将具体模块包装为 OperationHandle
pub fn into_handle<O: Operation + 'static>(op: O) -> OperationHandle {
    Arc::new(Mutex::new(op))
}

/// 模块作用目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationTarget {
    /// 已上线的 Session
    Session { session_id: i64, host_id: Option<i64> },
    /// 批量（Bot）模式下的 ip:port
    Endpoint {
        ip: String,
        port: u16,
        protocol: String,
    },
    None,
}

impl std::fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationTarget::Session { session_id, .. } => write!(f, "session {}", session_id),
            OperationTarget::Endpoint { ip, port, protocol } => {
                write!(f, "{}:{}/{}", ip, port, protocol)
            }
            OperationTarget::None => write!(f, "-"),
        }
    }
}

/// 模块身份信息，提交后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    /// 渗透服务模块类型（post / auxiliary / exploit ...）
    pub op_type: String,
    /// 渗透服务模块路径
    pub module_name: String,
    /// 模块参数（对应 RPC 的 opts）
    pub params: Map<String, Value>,
    /// 执行通道标记，由 Dispatcher 解析
    pub lane: String,
    pub display_name: String,
    pub target: OperationTarget,
    pub author: Option<String>,
}

impl OperationSpec {
    pub fn new(
        op_type: impl Into<String>,
        module_name: impl Into<String>,
        lane: impl Into<String>,
        display_name: impl Into<String>,
        target: OperationTarget,
    ) -> Self {
        Self {
            op_type: op_type.into(),
            module_name: module_name.into(),
            params: Map::new(),
            lane: lane.into(),
            display_name: display_name.into(),
            target,
            author: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: Value) {
        self.params.insert(key.into(), value);
    }

    /// 人类可读的目标描述
    pub fn target_str(&self) -> String {
        self.target.to_string()
    }
}

/// 模块输出的一行日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub level: NoticeLevel,
    pub text: String,
}

/// 模块输出缓冲：日志行 + 可选结构化结果；clean_log 时清空
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOutput {
    lines: Vec<OutputLine>,
    result: Option<Value>,
}

impl OperationOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.lines.push(OutputLine {
            level,
            text: text.into(),
        });
    }

    pub fn log_info(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Info, text);
    }

    pub fn log_good(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Success, text);
    }

    pub fn log_warning(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Warning, text);
    }

    pub fn log_error(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Error, text);
    }

    pub fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.result.is_none()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.result = None;
    }
}

/// 后渗透模块接口
///
/// 所有方法均在该实例自身的锁内调用。callback 返回 Err 或 panic 都只影响当前这条回调，
/// 登记项仍会被回收。
#[async_trait]
pub trait Operation: Send + Sync {
    fn spec(&self) -> &OperationSpec;

    fn spec_mut(&mut self) -> &mut OperationSpec;

    fn output(&self) -> &OperationOutput;

    fn output_mut(&mut self) -> &mut OperationOutput;

    /// 提交前的前置检查，可在此修正参数；Err 中为未通过原因
    fn check(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// 清理上一次回调留下的结果
    fn clean_log(&mut self) {
        self.output_mut().clear();
    }

    /// 处理渗透服务返回的结果
    async fn callback(
        &mut self,
        status: bool,
        message: Option<String>,
        data: Value,
    ) -> Result<(), String>;

    /// 本地执行（仅定时任务通道使用）
    async fn run(&mut self) -> Result<(), String> {
        Err(format!(
            "module {} does not support local execution",
            self.spec().module_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        let session = OperationTarget::Session {
            session_id: 3,
            host_id: Some(1),
        };
        assert_eq!(session.to_string(), "session 3");

        let endpoint = OperationTarget::Endpoint {
            ip: "10.0.0.5".into(),
            port: 445,
            protocol: "tcp".into(),
        };
        assert_eq!(endpoint.to_string(), "10.0.0.5:445/tcp");
    }

    #[test]
    fn test_output_clear() {
        let mut out = OperationOutput::new();
        out.log_good("done");
        out.set_result(serde_json::json!({"X": 1}));
        assert!(!out.is_empty());
        out.clear();
        assert!(out.is_empty());
    }

    #[test]
    fn test_spec_params() {
        let mut spec = OperationSpec::new(
            "post",
            "multi/gather/info",
            "post_msf_job",
            "Info",
            OperationTarget::None,
        );
        spec.set_param("SESSION", serde_json::json!(3));
        assert_eq!(spec.param("SESSION"), Some(&serde_json::json!(3)));
        assert_eq!(spec.param_str("SESSION"), None);
    }
}
