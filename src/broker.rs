//! 执行代理
//!
//! 两种执行方式：
//! - `run_sync`：同步调用渗透服务，阻塞至结果返回或超时，不触碰登记表
//! - `submit_background_job`：强制后台运行，成功后以渗透服务返回的 uuid 为关联 ID 登记
//!
//! RPC 路径的所有错误在此处消化为 bool + 通知，不向 Dispatcher 抛出。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::ExecError;
use crate::notice::Notifier;
use crate::operation::{OperationHandle, OperationSpec};
use crate::registry::{PendingTask, PendingTaskRegistry};
use crate::rpc::{ModuleExecuteRequest, RpcClient, LICENSE_EXPIRED_SENTINEL};

/// 执行代理：持有 RPC 客户端、登记表与通知器
pub struct ExecutionBroker {
    rpc: Arc<dyn RpcClient>,
    registry: Arc<PendingTaskRegistry>,
    notifier: Arc<dyn Notifier>,
    /// 同步调用时在远端超时之外额外等待的时间
    timeout_grace: Duration,
}

impl ExecutionBroker {
    pub fn new(
        rpc: Arc<dyn RpcClient>,
        registry: Arc<PendingTaskRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            rpc,
            registry,
            notifier,
            timeout_grace: Duration::from_secs(5),
        }
    }

    pub fn with_timeout_grace(mut self, secs: u64) -> Self {
        self.timeout_grace = Duration::from_secs(secs);
        self
    }

    pub fn registry(&self) -> &Arc<PendingTaskRegistry> {
        &self.registry
    }

    /// 同步执行模块，返回渗透服务的原始结果
    ///
    /// timeout_secs 同时作为远端超时和本地等待上限（加上 grace）；为 0 时本地不设上限。
    pub async fn run_sync(
        &self,
        op_type: &str,
        module_name: &str,
        params: Map<String, Value>,
        run_as_job: bool,
        timeout_secs: u64,
    ) -> Result<Value, ExecError> {
        let request = ModuleExecuteRequest {
            op_type: op_type.to_string(),
            module_name: module_name.to_string(),
            params,
            run_as_job,
            timeout_secs,
        };

        let call = self.rpc.module_execute(&request);
        let result = if timeout_secs == 0 {
            call.await
        } else {
            let limit = Duration::from_secs(timeout_secs).saturating_add(self.timeout_grace);
            match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::warn!(module = %module_name, "Synchronous module call timed out after {:?}", limit);
                    return Err(ExecError::RpcUnavailable(format!(
                        "no response within {}s",
                        limit.as_secs()
                    )));
                }
            }
        };

        match result {
            Ok(Value::Null) => Err(ExecError::RpcUnavailable("empty response".to_string())),
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(module = %module_name, "Synchronous module call failed: {}", e);
                Err(ExecError::RpcUnavailable(e.to_string()))
            }
        }
    }

    /// 提交后台任务并登记；返回是否成功，失败原因已通过通知告知用户
    pub async fn submit_background_job(&self, operation: OperationHandle) -> bool {
        // 仅在读取身份信息时持锁，RPC 调用期间不持锁
        let spec = operation.lock().await.spec().clone();
        let target = spec.target_str();

        match self.try_submit(&spec, operation).await {
            Ok(task) => {
                tracing::info!(
                    module = %spec.display_name,
                    job_id = ?task.job_id,
                    correlation_id = %task.correlation_id,
                    "Module registered as pending task"
                );
                self.notifier
                    .info(format!("module: {} {} started", spec.display_name, target));
                true
            }
            Err(ExecError::RpcUnavailable(reason)) => {
                tracing::warn!(module = %spec.display_name, "RPC unavailable: {}", reason);
                self.notifier.warning(format!(
                    "service connection failed, cannot run module: {}",
                    spec.display_name
                ));
                false
            }
            Err(ExecError::RemoteLicenseExpired) => {
                self.notifier.warning(format!(
                    "license expired, cannot run module: {}",
                    spec.display_name
                ));
                false
            }
            Err(ExecError::JobCreationRejected(detail)) => {
                tracing::warn!(module = %spec.display_name, "Background job creation failed: {}", detail);
                self.notifier.warning(format!(
                    "module: {} {} background task creation failed, check input parameters",
                    spec.display_name, target
                ));
                false
            }
            Err(e) => {
                tracing::error!(module = %spec.display_name, "Background job not tracked: {}", e);
                self.notifier.error(format!(
                    "module: {} {} could not be tracked: {}",
                    spec.display_name, target, e
                ));
                false
            }
        }
    }

    /// 每个失败步骤映射到一种 ExecError
    async fn try_submit(
        &self,
        spec: &OperationSpec,
        operation: OperationHandle,
    ) -> Result<PendingTask, ExecError> {
        let request = ModuleExecuteRequest {
            op_type: spec.op_type.clone(),
            module_name: spec.module_name.clone(),
            params: spec.params.clone(),
            run_as_job: true,
            timeout_secs: 0,
        };

        let response = self
            .rpc
            .module_execute(&request)
            .await
            .map_err(|e| ExecError::RpcUnavailable(e.to_string()))?;

        // 成功时形如 {"job_id": 3, "uuid": "dbcb2530-...", ...}
        let body = match response {
            Value::Null => return Err(ExecError::RpcUnavailable("empty response".to_string())),
            Value::String(s) if s == LICENSE_EXPIRED_SENTINEL => {
                return Err(ExecError::RemoteLicenseExpired)
            }
            Value::Object(body) => body,
            other => {
                return Err(ExecError::JobCreationRejected(format!(
                    "unexpected response: {}",
                    other
                )))
            }
        };

        let uuid = body.get("uuid").and_then(|v| v.as_str()).map(str::to_string);
        let job_id = match body.get("job_id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => {
                return Err(ExecError::JobCreationRejected(format!(
                    "no job_id for uuid {}",
                    uuid.as_deref().unwrap_or("-")
                )))
            }
        };
        let uuid = uuid.ok_or_else(|| {
            ExecError::JobCreationRejected(format!("job {} returned without uuid", job_id))
        })?;

        let task = PendingTask::new(uuid, Some(job_id), operation, spec.lane.clone());
        self.registry.put(task.clone()).await?;
        Ok(task)
    }
}
