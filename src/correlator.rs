//! 回调关联
//!
//! 渗透服务把后台 job 的结果通过独立的订阅通道异步推送，三类消息各有一个处理函数：
//! - result：终态结果，调用模块回调、写历史、回收登记项
//! - heartbeat：中间进度，调用同一回调但不回收登记项
//! - log：日志，直接转为通知，不访问登记表
//!
//! 每条消息的每个步骤各自隔离失败：解码、查找、回调、持久化任一步出错只影响当前消息，
//! 处理函数本身永不返回错误、永不向外 panic。一旦查找成功，result 消息必然回收登记项。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{ExecError, RegistryError};
use crate::history::{HistoryEntry, HistoryStore};
use crate::notice::{NoticeLevel, Notifier};
use crate::operation::{Operation, OperationHandle};
use crate::registry::{PendingTask, PendingTaskRegistry};

/// 订阅通道类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Result,
    Heartbeat,
    Log,
}

/// 订阅通道投递的消息外壳，data 为 JSON 编码的字符串
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub data: String,
}

impl InboundMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

/// 带通道类别的消息（stdin / 订阅桥接使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: Channel,
    #[serde(flatten)]
    pub message: InboundMessage,
}

/// result / heartbeat 消息体
///
/// 形如 `{"job_id": null, "uuid": "1b1a...", "status": true, "message": null, "data": {...}}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultPayload {
    pub uuid: String,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// log 消息体
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogPayload {
    pub content: String,
    #[serde(default)]
    pub level: String,
}

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// 结果已交付且登记项已回收
    Retired,
    /// 进度已交付，登记项保留
    Delivered,
    /// 日志已转为通知
    Forwarded,
    /// 消息被丢弃，登记表未改动
    Dropped(ExecError),
}

fn decode_result(raw: &str) -> Result<ResultPayload, ExecError> {
    serde_json::from_str(raw).map_err(|e| ExecError::PayloadDecodeError(e.to_string()))
}

fn decode_log(raw: &str) -> Result<LogPayload, ExecError> {
    serde_json::from_str(raw).map_err(|e| ExecError::PayloadDecodeError(e.to_string()))
}

/// 调用模块回调；Err 与 panic 都归为 HandlerFault
async fn invoke_callback(op: &mut dyn Operation, payload: &ResultPayload) -> Result<(), ExecError> {
    let call = op.callback(payload.status, payload.message.clone(), payload.data.clone());
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ExecError::HandlerFault(e)),
        Err(_) => Err(ExecError::HandlerFault("callback panicked".to_string())),
    }
}

/// 回调关联器
pub struct CallbackCorrelator {
    registry: Arc<PendingTaskRegistry>,
    notifier: Arc<dyn Notifier>,
    history: Arc<dyn HistoryStore>,
}

impl CallbackCorrelator {
    pub fn new(
        registry: Arc<PendingTaskRegistry>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            registry,
            notifier,
            history,
        }
    }

    /// 按通道类别分发
    pub async fn handle(&self, channel: Channel, message: &InboundMessage) -> CallbackOutcome {
        match channel {
            Channel::Result => self.handle_result(message).await,
            Channel::Heartbeat => self.handle_heartbeat(message).await,
            Channel::Log => self.handle_log(message).await,
        }
    }

    /// 终态结果
    pub async fn handle_result(&self, message: &InboundMessage) -> CallbackOutcome {
        match self.deliver(message, true).await {
            Ok(outcome) => outcome,
            Err(e) => self.drop_message("result", e),
        }
    }

    /// 中间进度，不回收登记项
    pub async fn handle_heartbeat(&self, message: &InboundMessage) -> CallbackOutcome {
        match self.deliver(message, false).await {
            Ok(outcome) => outcome,
            Err(e) => self.drop_message("heartbeat", e),
        }
    }

    /// 日志转通知
    pub async fn handle_log(&self, message: &InboundMessage) -> CallbackOutcome {
        match decode_log(&message.data) {
            Ok(log) => {
                self.notifier
                    .send(NoticeLevel::parse(&log.level), format!("MSF> {}", log.content));
                CallbackOutcome::Forwarded
            }
            Err(e) => self.drop_message("log", e),
        }
    }

    fn drop_message(&self, kind: &str, err: ExecError) -> CallbackOutcome {
        match &err {
            ExecError::CorrelationMiss(id) => {
                tracing::warn!(correlation_id = %id, "No matching pending task for {} message", kind);
            }
            _ => tracing::error!("Dropping {} message: {}", kind, err),
        }
        CallbackOutcome::Dropped(err)
    }

    async fn lookup(&self, correlation_id: &str) -> Result<(PendingTask, OperationHandle), ExecError> {
        let task = self.registry.get(correlation_id).await.map_err(|e| match e {
            RegistryError::NotFound(id) => ExecError::CorrelationMiss(id),
            other => other.into(),
        })?;
        let operation = task
            .operation
            .clone()
            .ok_or_else(|| ExecError::MissingOperation(correlation_id.to_string()))?;
        Ok((task, operation))
    }

    /// 持有实例锁后再次确认登记项仍指向同一实例
    async fn confirm_pending(&self, correlation_id: &str, operation: &OperationHandle) -> Result<(), ExecError> {
        let current = self
            .registry
            .get(correlation_id)
            .await
            .ok()
            .and_then(|task| task.operation);
        match current {
            Some(current) if Arc::ptr_eq(&current, operation) => Ok(()),
            _ => Err(ExecError::CorrelationMiss(correlation_id.to_string())),
        }
    }

    /// 解码 → 查找 → 加锁复核 →（终态时）回收 → 回调 → 持久化
    async fn deliver(&self, message: &InboundMessage, terminal: bool) -> Result<CallbackOutcome, ExecError> {
        let payload = decode_result(&message.data)?;
        let (task, operation) = self.lookup(&payload.uuid).await?;

        let mut op = operation.lock().await;
        // 等锁期间登记项可能已被另一条结果回收
        self.confirm_pending(&payload.uuid, &operation).await?;
        if terminal {
            self.registry.delete(&task.correlation_id).await;
        }
        let name = op.spec().display_name.clone();
        let target = op.spec().target_str();
        tracing::info!(
            module = %name,
            job_id = ?payload.job_id.or(task.job_id),
            correlation_id = %payload.uuid,
            terminal,
            "Module callback"
        );

        op.clean_log();
        if let Err(e) = invoke_callback(&mut *op, &payload).await {
            tracing::error!(module = %name, "{}", e);
            self.notifier
                .error(format!("module {} callback raised an exception", name));
        }

        let entry = HistoryEntry::from_operation(&*op, Some(payload.status));
        drop(op);
        if let Err(e) = self.history.append(entry).await {
            let fault = ExecError::PersistenceFault(e.to_string());
            tracing::error!(module = %name, "{}", fault);
        }

        if terminal {
            self.notifier
                .success(format!("module: {} {} finished", name, target));
            Ok(CallbackOutcome::Retired)
        } else {
            self.notifier.info(format!("module: {} callback finished", name));
            Ok(CallbackOutcome::Delivered)
        }
    }
}

/// 订阅消息循环：每条消息独立 spawn 处理，互不阻塞
pub struct CallbackListener {
    correlator: Arc<CallbackCorrelator>,
}

impl CallbackListener {
    pub fn new(correlator: Arc<CallbackCorrelator>) -> Self {
        Self { correlator }
    }

    /// 运行直到 token 取消或发送端全部关闭；返回已分发的消息数
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<(Channel, InboundMessage)>,
        token: CancellationToken,
    ) -> usize {
        let mut dispatched = 0;
        let mut in_flight = tokio::task::JoinSet::new();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some((channel, message)) = next else {
                break;
            };
            let correlator = Arc::clone(&self.correlator);
            in_flight.spawn(async move {
                correlator.handle(channel, &message).await;
            });
            dispatched += 1;

            // 顺带回收已结束的任务
            while let Some(res) = in_flight.try_join_next() {
                if let Err(e) = res {
                    tracing::error!("Callback task aborted: {}", e);
                }
            }
        }

        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::error!("Callback task aborted: {}", e);
            }
        }
        tracing::info!(dispatched, "Callback listener stopped");
        dispatched
    }
}
