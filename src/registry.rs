//! 待回调任务登记表
//!
//! 关联 ID（渗透服务返回的 uuid，或批量提交时本地生成）→ 在途模块实例。
//! 进程内共享、不持久化：进程重启后在途任务全部丢失。
//!
//! 每个操作只在 HashMap 上短暂持锁，绝不跨 RPC 调用或模块回调持锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::RegistryError;
use crate::notice::Notifier;
use crate::operation::OperationHandle;

/// 在途任务记录
#[derive(Clone)]
pub struct PendingTask {
    /// 关联 ID，全局唯一
    pub correlation_id: String,
    /// 渗透服务分配的 job id（批量提交时为空）
    pub job_id: Option<i64>,
    pub operation: Option<OperationHandle>,
    /// 提交时间（秒级时间戳）
    pub submitted_at: i64,
    pub lane: String,
    /// 批量提交的分组 ID
    pub group_id: Option<String>,
}

impl PendingTask {
    pub fn new(
        correlation_id: impl Into<String>,
        job_id: Option<i64>,
        operation: OperationHandle,
        lane: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            job_id,
            operation: Some(operation),
            submitted_at: chrono::Utc::now().timestamp(),
            lane: lane.into(),
            group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// 是否为批量等待项
    pub fn is_waiting(&self) -> bool {
        self.group_id.is_some()
    }

    /// 距提交已过去的时间
    pub fn age(&self) -> Duration {
        let secs = chrono::Utc::now().timestamp() - self.submitted_at;
        Duration::from_secs(secs.max(0) as u64)
    }
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTask")
            .field("correlation_id", &self.correlation_id)
            .field("job_id", &self.job_id)
            .field("has_operation", &self.operation.is_some())
            .field("submitted_at", &self.submitted_at)
            .field("lane", &self.lane)
            .field("group_id", &self.group_id)
            .finish()
    }
}

/// 登记表：启动时创建一次，以 Arc 注入各组件
#[derive(Default)]
pub struct PendingTaskRegistry {
    tasks: RwLock<HashMap<String, PendingTask>>,
}

impl PendingTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入记录；关联 ID 已存在时返回 DuplicateKey，不覆盖
    pub async fn put(&self, task: PendingTask) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.correlation_id) {
            return Err(RegistryError::DuplicateKey(task.correlation_id));
        }
        tasks.insert(task.correlation_id.clone(), task);
        Ok(())
    }

    pub async fn get(&self, correlation_id: &str) -> Result<PendingTask, RegistryError> {
        self.tasks
            .read()
            .await
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(correlation_id.to_string()))
    }

    /// 删除记录；不存在时无操作，返回被删除的记录
    pub async fn delete(&self, correlation_id: &str) -> Option<PendingTask> {
        self.tasks.write().await.remove(correlation_id)
    }

    pub async fn list_by<F>(&self, predicate: F) -> Vec<PendingTask>
    where
        F: Fn(&PendingTask) -> bool,
    {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| predicate(t))
            .cloned()
            .collect()
    }

    /// 所有批量等待项
    pub async fn list_waiting(&self) -> Vec<PendingTask> {
        self.list_by(PendingTask::is_waiting).await
    }

    pub async fn list_group(&self, group_id: &str) -> Vec<PendingTask> {
        self.list_by(|t| t.group_id.as_deref() == Some(group_id))
            .await
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// 回收提交时间早于 max_age 的记录（回调永远不会到达的任务）
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<PendingTask> {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(max_age);
        let mut tasks = self.tasks.write().await;
        let stale_ids: Vec<String> = tasks
            .values()
            .filter(|t| t.submitted_at < cutoff)
            .map(|t| t.correlation_id.clone())
            .collect();
        stale_ids
            .iter()
            .filter_map(|id| tasks.remove(id))
            .collect()
    }
}

/// 启动定期回收任务；token 取消后退出
pub fn spawn_sweeper(
    registry: Arc<PendingTaskRegistry>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    max_age: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let reclaimed = registry.sweep_stale(max_age).await;
            for task in &reclaimed {
                tracing::warn!(
                    correlation_id = %task.correlation_id,
                    job_id = ?task.job_id,
                    "Reclaimed stale pending task"
                );
                notifier.warning(format!(
                    "task {} got no callback within {}s, tracking dropped",
                    task.correlation_id,
                    max_age.as_secs()
                ));
            }
        }
        tracing::debug!("Pending task sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{into_handle, OperationSpec, OperationTarget, RawModuleOperation};

    fn sample_op() -> OperationHandle {
        into_handle(RawModuleOperation::new(OperationSpec::new(
            "post",
            "multi/gather/info",
            "post_msf_job",
            "Info",
            OperationTarget::None,
        )))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let registry = PendingTaskRegistry::new();
        registry
            .put(PendingTask::new("abc", Some(3), sample_op(), "post_msf_job"))
            .await
            .unwrap();

        let task = registry.get("abc").await.unwrap();
        assert_eq!(task.job_id, Some(3));
        assert!(task.operation.is_some());

        assert!(registry.delete("abc").await.is_some());
        assert_eq!(
            registry.get("abc").await.unwrap_err(),
            RegistryError::NotFound("abc".into())
        );
        // 幂等
        assert!(registry.delete("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_put_keeps_original() {
        let registry = PendingTaskRegistry::new();
        registry
            .put(PendingTask::new("abc", Some(3), sample_op(), "post_msf_job"))
            .await
            .unwrap();
        let err = registry
            .put(PendingTask::new("abc", Some(9), sample_op(), "post_msf_job"))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey("abc".into()));
        assert_eq!(registry.get("abc").await.unwrap().job_id, Some(3));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_waiting_and_group() {
        let registry = PendingTaskRegistry::new();
        registry
            .put(PendingTask::new("a", None, sample_op(), "post_msf_job").with_group("g1"))
            .await
            .unwrap();
        registry
            .put(PendingTask::new("b", None, sample_op(), "post_msf_job").with_group("g2"))
            .await
            .unwrap();
        registry
            .put(PendingTask::new("c", Some(1), sample_op(), "post_msf_job"))
            .await
            .unwrap();

        assert_eq!(registry.list_waiting().await.len(), 2);
        let group = registry.list_group("g1").await;
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].correlation_id, "a");
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let registry = PendingTaskRegistry::new();
        let mut old = PendingTask::new("old", Some(1), sample_op(), "post_msf_job");
        old.submitted_at -= 7200;
        registry.put(old).await.unwrap();
        registry
            .put(PendingTask::new("fresh", Some(2), sample_op(), "post_msf_job"))
            .await
            .unwrap();

        let reclaimed = registry.sweep_stale(Duration::from_secs(3600)).await;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].correlation_id, "old");
        assert!(registry.get("fresh").await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_huge_max_age_keeps_everything() {
        let registry = PendingTaskRegistry::new();
        let mut old = PendingTask::new("old", Some(1), sample_op(), "post_msf_job");
        old.submitted_at -= 7200;
        registry.put(old).await.unwrap();

        let reclaimed = registry.sweep_stale(Duration::from_secs(u64::MAX)).await;
        assert!(reclaimed.is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_put_same_key() {
        let registry = Arc::new(PendingTaskRegistry::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .put(PendingTask::new("same", Some(i), sample_op(), "post_msf_job"))
                    .await
                    .is_ok()
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(registry.len().await, 1);
    }
}
