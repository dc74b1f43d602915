//! 引擎装配：登记表、执行代理、路由分发、回调关联、模块目录
//!
//! 登记表在此创建一次并以 Arc 注入所有组件，不存在全局可变状态。
//! create_post / create_bot 对应外部 REST 层的“执行模块”与“批量执行模块”入口。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::ExecutionBroker;
use crate::config::AppConfig;
use crate::core::ExecError;
use crate::correlator::{CallbackCorrelator, CallbackListener};
use crate::dispatcher::{BatchOutcome, ChannelWorkerQueue, Dispatcher, WorkerQueue};
use crate::history::{create_history_store, HistoryStore};
use crate::notice::{Notifier, TracingNotifier};
use crate::operation::{OperationCatalog, OperationHandle, OperationTarget};
use crate::registry::{spawn_sweeper, PendingTaskRegistry};
use crate::rpc::{HttpRpcClient, RpcClient};

/// 解析用户传入的 JSON 参数；格式错误时记录警告并使用空参数
pub fn parse_params(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!("Module params must be a JSON object, got: {}", other);
            Map::new()
        }
        Err(e) => {
            tracing::warn!("Module params are not valid JSON: {}", e);
            Map::new()
        }
    }
}

/// 引擎
pub struct Engine {
    config: AppConfig,
    registry: Arc<PendingTaskRegistry>,
    broker: Arc<ExecutionBroker>,
    dispatcher: Dispatcher,
    correlator: Arc<CallbackCorrelator>,
    catalog: OperationCatalog,
    notifier: Arc<dyn Notifier>,
    history: Arc<dyn HistoryStore>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        rpc: Arc<dyn RpcClient>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn HistoryStore>,
        worker_queue: Arc<dyn WorkerQueue>,
        catalog: OperationCatalog,
    ) -> Self {
        let registry = Arc::new(PendingTaskRegistry::new());
        let broker = Arc::new(
            ExecutionBroker::new(rpc, Arc::clone(&registry), Arc::clone(&notifier))
                .with_timeout_grace(config.rpc.timeout_grace_secs),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            worker_queue,
            Arc::clone(&notifier),
        );
        let correlator = Arc::new(CallbackCorrelator::new(
            Arc::clone(&registry),
            Arc::clone(&notifier),
            Arc::clone(&history),
        ));
        Self {
            config,
            registry,
            broker,
            dispatcher,
            correlator,
            catalog,
            notifier,
            history,
        }
    }

    /// 按配置装配：HTTP RPC、tracing 通知、配置指定的历史存储、内置模块目录；
    /// 返回定时任务通道的接收端，由调用方交给 ScheduledWorker
    pub async fn from_config(config: AppConfig) -> (Self, mpsc::UnboundedReceiver<OperationHandle>) {
        let rpc = Arc::new(HttpRpcClient::new(
            config.rpc.url.clone(),
            config.rpc.token.clone(),
            config.rpc.request_timeout_secs,
        ));
        let history =
            create_history_store(&config.history.backend, config.history.path.as_deref()).await;
        let (queue, queue_rx) = ChannelWorkerQueue::new();
        let engine = Self::new(
            config,
            rpc,
            Arc::new(TracingNotifier),
            history,
            Arc::new(queue),
            OperationCatalog::with_builtin(),
        );
        (engine, queue_rx)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PendingTaskRegistry> {
        &self.registry
    }

    pub fn catalog_mut(&mut self) -> &mut OperationCatalog {
        &mut self.catalog
    }

    pub fn correlator(&self) -> &Arc<CallbackCorrelator> {
        &self.correlator
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn listener(&self) -> CallbackListener {
        CallbackListener::new(Arc::clone(&self.correlator))
    }

    /// 启动无回调任务回收；配置 stale_after_secs = 0 时不启动
    pub fn spawn_sweeper(&self, token: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let cfg = &self.config.registry;
        if cfg.stale_after_secs == 0 {
            tracing::info!("Stale pending task sweep disabled");
            return None;
        }
        Some(spawn_sweeper(
            Arc::clone(&self.registry),
            Arc::clone(&self.notifier),
            Duration::from_secs(cfg.sweep_interval_secs.max(1)),
            Duration::from_secs(cfg.stale_after_secs),
            token,
        ))
    }

    /// 同步执行，超时使用配置默认值
    pub async fn run_sync(
        &self,
        op_type: &str,
        module_name: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ExecError> {
        self.broker
            .run_sync(op_type, module_name, params, false, self.config.rpc.sync_timeout_secs)
            .await
    }

    /// 对单个目标执行模块
    pub async fn create_post(
        &self,
        module: &str,
        target: OperationTarget,
        raw_params: &str,
    ) -> Result<(), ExecError> {
        let params = parse_params(raw_params);
        let operation = self.catalog.create(module, target, params).await?;
        self.dispatcher.dispatch(operation).await
    }

    /// 对多个目标批量执行同一模块；未通过检查的目标被跳过
    pub async fn create_bot(
        &self,
        module: &str,
        targets: Vec<OperationTarget>,
        raw_params: &str,
    ) -> Result<BatchOutcome, ExecError> {
        let params = parse_params(raw_params);
        let mut operations = Vec::with_capacity(targets.len());
        for target in targets {
            operations.push(self.catalog.create(module, target, params.clone()).await?);
        }
        Ok(self.dispatcher.dispatch_batch(operations).await)
    }
}
