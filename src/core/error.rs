//! 执行与回调错误类型
//!
//! RPC 路径的错误在 ExecutionBroker 边界被消化为 bool + 通知；回调路径的错误在单条消息内被消化，
//! 二者都不会向上传播。此处的枚举只用于让每个可失败步骤有明确的归类。

use thiserror::Error;

/// 模块提交、路由与回调关联过程中的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// 渗透服务不可达、超时或返回空
    #[error("RPC service unavailable: {0}")]
    RpcUnavailable(String),

    #[error("Remote license expired")]
    RemoteLicenseExpired,

    /// 响应中缺少 job_id（通常是参数错误）
    #[error("Background job creation rejected: {0}")]
    JobCreationRejected(String),

    #[error("Payload decode error: {0}")]
    PayloadDecodeError(String),

    /// 登记表中没有对应的关联 ID
    #[error("No pending task for correlation id: {0}")]
    CorrelationMiss(String),

    /// 登记项存在但未持有模块实例
    #[error("Pending task {0} holds no operation")]
    MissingOperation(String),

    #[error("Operation callback failed: {0}")]
    HandlerFault(String),

    #[error("History persistence failed: {0}")]
    PersistenceFault(String),

    #[error("Unknown lane tag: {0}")]
    UnknownLane(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// check() 未通过
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// 登记表操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// put 时关联 ID 已存在；不会覆盖旧记录
    #[error("Duplicate correlation id: {0}")]
    DuplicateKey(String),

    #[error("Correlation id not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_converts() {
        let err: ExecError = RegistryError::DuplicateKey("abc".to_string()).into();
        assert_eq!(err.to_string(), "Duplicate correlation id: abc");
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ExecError::CorrelationMiss("abc".into()).to_string(),
            "No pending task for correlation id: abc"
        );
        assert_eq!(ExecError::RemoteLicenseExpired.to_string(), "Remote license expired");
    }
}
