//! 路由分发
//!
//! 按模块的执行通道标记决定去向：
//! - `post_msf_job`：后台 job 通道，交给 ExecutionBroker 提交并登记
//! - `post_python_job`：定时任务通道，交给外部 WorkerQueue，不经过登记表
//!
//! 批量（Bot）提交：同一模块作用于多个目标，逐个 check，未通过的跳过并通知，
//! 通过的以本地生成的关联 ID 写入登记表等待后续编排，不等待远端完成。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};

use crate::broker::ExecutionBroker;
use crate::core::ExecError;
use crate::history::{HistoryEntry, HistoryStore};
use crate::notice::Notifier;
use crate::operation::OperationHandle;
use crate::registry::{PendingTask, PendingTaskRegistry};

/// 执行通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// 渗透服务后台 job，结果经订阅通道异步回调
    BackgroundJob,
    /// 本地定时任务队列
    ScheduledWorker,
}

impl Lane {
    pub fn tag(&self) -> &'static str {
        match self {
            Lane::BackgroundJob => "post_msf_job",
            Lane::ScheduledWorker => "post_python_job",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, ExecError> {
        match tag {
            "post_msf_job" => Ok(Lane::BackgroundJob),
            "post_python_job" => Ok(Lane::ScheduledWorker),
            other => Err(ExecError::UnknownLane(other.to_string())),
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// 定时任务通道的队列接口
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// 入队；返回是否被接受
    async fn enqueue(&self, operation: OperationHandle) -> bool;
}

/// 基于 mpsc 的队列，消费端为 ScheduledWorker
pub struct ChannelWorkerQueue {
    tx: mpsc::UnboundedSender<OperationHandle>,
}

impl ChannelWorkerQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkerQueue for ChannelWorkerQueue {
    async fn enqueue(&self, operation: OperationHandle) -> bool {
        self.tx.send(operation).is_ok()
    }
}

/// 定时任务执行器：限制并发地在本地运行模块，完成后写历史并通知
pub struct ScheduledWorker {
    history: Arc<dyn HistoryStore>,
    notifier: Arc<dyn Notifier>,
    max_concurrent: usize,
}

impl ScheduledWorker {
    pub fn new(history: Arc<dyn HistoryStore>, notifier: Arc<dyn Notifier>, max_concurrent: usize) -> Self {
        Self {
            history,
            notifier,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 消费队列直到发送端全部关闭
    pub async fn start(self, mut rx: mpsc::UnboundedReceiver<OperationHandle>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        while let Some(operation) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => continue,
            };
            let history = Arc::clone(&self.history);
            let notifier = Arc::clone(&self.notifier);

            tokio::spawn(async move {
                let _permit = permit;
                let mut op = operation.lock().await;
                let name = op.spec().display_name.clone();
                let target = op.spec().target_str();
                op.clean_log();

                let outcome = AssertUnwindSafe(op.run()).catch_unwind().await;
                let ok = match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(module = %name, "Local module run failed: {}", e);
                        op.output_mut().log_error(e);
                        false
                    }
                    Err(_) => {
                        tracing::error!(module = %name, "Local module run panicked");
                        op.output_mut().log_error("module raised an exception");
                        false
                    }
                };

                let entry = HistoryEntry::from_operation(&*op, Some(ok));
                drop(op);
                if let Err(e) = history.append(entry).await {
                    tracing::error!(module = %name, "History write failed: {}", e);
                }
                if ok {
                    notifier.success(format!("module: {} {} finished", name, target));
                } else {
                    notifier.error(format!("module: {} {} failed", name, target));
                }
            });
        }
        tracing::debug!("Scheduled worker queue closed");
    }
}

/// 批量提交结果
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub group_id: String,
    /// 已登记的关联 ID
    pub accepted: Vec<String>,
    /// (目标, 原因)
    pub skipped: Vec<(String, String)>,
}

/// 路由分发器
pub struct Dispatcher {
    broker: Arc<ExecutionBroker>,
    registry: Arc<PendingTaskRegistry>,
    worker_queue: Arc<dyn WorkerQueue>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<ExecutionBroker>,
        registry: Arc<PendingTaskRegistry>,
        worker_queue: Arc<dyn WorkerQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            broker,
            registry,
            worker_queue,
            notifier,
        }
    }

    /// 检查并路由单个模块
    pub async fn dispatch(&self, operation: OperationHandle) -> Result<(), ExecError> {
        let lane_tag = {
            let mut op = operation.lock().await;
            run_check(&mut *op)?;
            op.spec().lane.clone()
        };
        self.route(operation, &lane_tag).await
    }

    /// 按通道标记路由；未知标记视为配置错误
    pub async fn route(&self, operation: OperationHandle, lane_tag: &str) -> Result<(), ExecError> {
        let lane = Lane::from_tag(lane_tag).map_err(|e| {
            tracing::error!("Operation has invalid lane configuration: {}", e);
            e
        })?;

        match lane {
            Lane::BackgroundJob => {
                if self.broker.submit_background_job(operation).await {
                    Ok(())
                } else {
                    Err(ExecError::SubmissionFailed("background job not created".to_string()))
                }
            }
            Lane::ScheduledWorker => {
                let name = operation.lock().await.spec().display_name.clone();
                if self.worker_queue.enqueue(operation).await {
                    self.notifier.info(format!("module: {} queued", name));
                    Ok(())
                } else {
                    tracing::error!(module = %name, "Worker queue rejected operation");
                    Err(ExecError::SubmissionFailed("worker queue unavailable".to_string()))
                }
            }
        }
    }

    /// 批量提交；单个目标失败不影响其他目标
    pub async fn dispatch_batch(&self, operations: Vec<OperationHandle>) -> BatchOutcome {
        let group_id = uuid::Uuid::new_v4().simple().to_string();
        let mut outcome = BatchOutcome {
            group_id: group_id.clone(),
            ..Default::default()
        };

        for operation in operations {
            let (name, target, lane_tag, checked) = {
                let mut op = operation.lock().await;
                let checked = run_check(&mut *op);
                let spec = op.spec();
                (
                    spec.display_name.clone(),
                    spec.target_str(),
                    spec.lane.clone(),
                    checked,
                )
            };

            if let Err(e) = checked {
                let reason = match e {
                    ExecError::PreconditionFailed(msg) => msg,
                    other => other.to_string(),
                };
                self.notifier.warning(format!(
                    "module:{} {} precondition failed, reason: {}",
                    name, target, reason
                ));
                outcome.skipped.push((target, reason));
                continue;
            }

            if let Err(e) = Lane::from_tag(&lane_tag) {
                tracing::error!(module = %name, "Skipping batch target: {}", e);
                outcome.skipped.push((target, e.to_string()));
                continue;
            }

            let correlation_id = uuid::Uuid::new_v4().to_string();
            let task = PendingTask::new(correlation_id.clone(), None, operation, lane_tag)
                .with_group(group_id.clone());
            match self.registry.put(task).await {
                Ok(()) => outcome.accepted.push(correlation_id),
                Err(e) => {
                    tracing::error!(module = %name, "Batch target not registered: {}", e);
                    outcome.skipped.push((target, e.to_string()));
                }
            }
        }

        tracing::info!(
            group_id = %group_id,
            accepted = outcome.accepted.len(),
            skipped = outcome.skipped.len(),
            "Batch submission registered"
        );
        outcome
    }
}

/// 执行 check()；panic 视为未通过
fn run_check(op: &mut dyn crate::operation::Operation) -> Result<(), ExecError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| op.check())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(ExecError::PreconditionFailed(msg)),
        Err(_) => {
            tracing::warn!(module = %op.spec().display_name, "check() panicked");
            Err(ExecError::PreconditionFailed("check raised an exception".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::notice::{ChannelNotifier, Notice, NoticeLevel};
    use crate::operation::{into_handle, Operation, OperationOutput, OperationSpec, OperationTarget};
    use crate::rpc::ScriptedRpcClient;
    use serde_json::Value;

    /// 可配置 check 结果的测试模块
    struct ProbeOperation {
        spec: OperationSpec,
        output: OperationOutput,
        pass: bool,
    }

    impl ProbeOperation {
        fn handle(lane: &str, ip: &str, pass: bool) -> OperationHandle {
            into_handle(Self {
                spec: OperationSpec::new(
                    "auxiliary",
                    "scanner/probe",
                    lane,
                    "Probe",
                    OperationTarget::Endpoint {
                        ip: ip.to_string(),
                        port: 445,
                        protocol: "tcp".to_string(),
                    },
                ),
                output: OperationOutput::new(),
                pass,
            })
        }
    }

    #[async_trait]
    impl Operation for ProbeOperation {
        fn spec(&self) -> &OperationSpec {
            &self.spec
        }
        fn spec_mut(&mut self) -> &mut OperationSpec {
            &mut self.spec
        }
        fn output(&self) -> &OperationOutput {
            &self.output
        }
        fn output_mut(&mut self) -> &mut OperationOutput {
            &mut self.output
        }
        fn check(&mut self) -> Result<(), String> {
            if self.pass {
                Ok(())
            } else {
                Err("port closed".to_string())
            }
        }
        async fn callback(&mut self, _: bool, _: Option<String>, _: Value) -> Result<(), String> {
            Ok(())
        }
        async fn run(&mut self) -> Result<(), String> {
            self.output.log_good("local run");
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<PendingTaskRegistry>,
        notices: mpsc::UnboundedReceiver<Notice>,
        queued: mpsc::UnboundedReceiver<OperationHandle>,
    }

    fn fixture(responses: Vec<Value>) -> Fixture {
        let registry = Arc::new(PendingTaskRegistry::new());
        let (notifier, notices) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let rpc = Arc::new(ScriptedRpcClient::with_responses(responses.into_iter().map(Ok)));
        let broker = Arc::new(ExecutionBroker::new(rpc, registry.clone(), notifier.clone()));
        let (queue, queued) = ChannelWorkerQueue::new();
        Fixture {
            dispatcher: Dispatcher::new(broker, registry.clone(), Arc::new(queue), notifier),
            registry,
            notices,
            queued,
        }
    }

    #[test]
    fn test_lane_tags() {
        assert_eq!(Lane::from_tag("post_msf_job").unwrap(), Lane::BackgroundJob);
        assert_eq!(Lane::from_tag("post_python_job").unwrap(), Lane::ScheduledWorker);
        assert_eq!(
            Lane::from_tag("bogus").unwrap_err(),
            ExecError::UnknownLane("bogus".into())
        );
    }

    #[tokio::test]
    async fn test_dispatch_background_lane() {
        let f = fixture(vec![serde_json::json!({"job_id": 1, "uuid": "u1"})]);
        f.dispatcher
            .dispatch(ProbeOperation::handle("post_msf_job", "10.0.0.1", true))
            .await
            .unwrap();
        assert!(f.registry.get("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_scheduled_lane_bypasses_registry() {
        let mut f = fixture(vec![]);
        f.dispatcher
            .dispatch(ProbeOperation::handle("post_python_job", "10.0.0.1", true))
            .await
            .unwrap();
        assert!(f.registry.is_empty().await);
        assert!(f.queued.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_lane_fails() {
        let f = fixture(vec![]);
        let err = f
            .dispatcher
            .dispatch(ProbeOperation::handle("nowhere", "10.0.0.1", true))
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::UnknownLane("nowhere".into()));
    }

    #[tokio::test]
    async fn test_dispatch_precondition_failed() {
        let f = fixture(vec![serde_json::json!({"job_id": 1, "uuid": "u1"})]);
        let err = f
            .dispatcher
            .dispatch(ProbeOperation::handle("post_msf_job", "10.0.0.1", false))
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::PreconditionFailed("port closed".into()));
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dispatch_submission_failure() {
        let f = fixture(vec![Value::Null]);
        let err = f
            .dispatcher
            .dispatch(ProbeOperation::handle("post_msf_job", "10.0.0.1", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SubmissionFailed(_)));
    }

    #[tokio::test]
    async fn test_batch_skips_failed_target() {
        let mut f = fixture(vec![]);
        let ops = vec![
            ProbeOperation::handle("post_msf_job", "10.0.0.1", true),
            ProbeOperation::handle("post_msf_job", "10.0.0.2", false),
            ProbeOperation::handle("post_msf_job", "10.0.0.3", true),
        ];
        let outcome = f.dispatcher.dispatch_batch(ops).await;

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].0, "10.0.0.2:445/tcp");
        assert_eq!(f.registry.len().await, 2);

        let waiting = f.registry.list_group(&outcome.group_id).await;
        assert_eq!(waiting.len(), 2);
        assert!(waiting.iter().all(|t| t.job_id.is_none()));

        let notice = f.notices.try_recv().unwrap();
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert!(notice.content.contains("10.0.0.2"));
        assert!(notice.content.contains("port closed"));
        assert!(f.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scheduled_worker_runs_and_records() {
        let history = Arc::new(MemoryHistoryStore::default());
        let (notifier, mut notices) = ChannelNotifier::new();
        let (queue, rx) = ChannelWorkerQueue::new();
        let worker = ScheduledWorker::new(history.clone(), Arc::new(notifier), 2);

        assert!(queue.enqueue(ProbeOperation::handle("post_python_job", "10.0.0.9", true)).await);
        drop(queue);
        worker.start(rx).await;

        let notice = tokio::time::timeout(std::time::Duration::from_secs(1), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.level, NoticeLevel::Success);
        let entries = history.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, Some(true));
        assert_eq!(entries[0].lines[0].text, "local run");
    }
}
