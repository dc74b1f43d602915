//! 模块目录
//!
//! 启动时按名称注册模块工厂函数，运行时由名称创建模块实例；不做按路径的动态加载。

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::core::ExecError;
use crate::operation::{into_handle, OperationHandle, OperationSpec, OperationTarget, RawModuleOperation};

/// 模块工厂：由目标与参数构造实例
pub type OperationFactory = fn(OperationTarget, Map<String, Value>) -> OperationHandle;

/// 模块元信息（作者、描述）
#[derive(Debug, Clone, Default)]
pub struct OperationMeta {
    pub author: Option<String>,
    pub description: String,
}

struct CatalogEntry {
    meta: OperationMeta,
    factory: OperationFactory,
}

/// 模块目录：按名称存储工厂，支持 register / create / meta / names
#[derive(Default)]
pub struct OperationCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置的透传模块（raw）
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            "raw",
            OperationMeta {
                author: None,
                description: "Run a framework module and keep its raw result".to_string(),
            },
            raw_factory,
        );
        catalog
    }

    pub fn register(&mut self, name: impl Into<String>, meta: OperationMeta, factory: OperationFactory) {
        self.entries.insert(name.into(), CatalogEntry { meta, factory });
    }

    /// 创建实例并写入作者信息；名称未注册时返回 UnknownOperation
    pub async fn create(
        &self,
        name: &str,
        target: OperationTarget,
        params: Map<String, Value>,
    ) -> Result<OperationHandle, ExecError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ExecError::UnknownOperation(name.to_string()))?;
        let handle = (entry.factory)(target, params);
        if entry.meta.author.is_some() {
            handle.lock().await.spec_mut().author = entry.meta.author.clone();
        }
        Ok(handle)
    }

    pub fn meta(&self, name: &str) -> Option<&OperationMeta> {
        self.entries.get(name).map(|e| &e.meta)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// raw 模块：params 中的 MODULE_TYPE / MODULE_NAME / LANE 决定实际执行的模块
fn raw_factory(target: OperationTarget, mut params: Map<String, Value>) -> OperationHandle {
    let take = |params: &mut Map<String, Value>, key: &str, default: &str| {
        params
            .remove(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    };
    let op_type = take(&mut params, "MODULE_TYPE", "post");
    let module_name = take(&mut params, "MODULE_NAME", "");
    let lane = take(&mut params, "LANE", crate::dispatcher::Lane::BackgroundJob.tag());
    if let OperationTarget::Session { session_id, .. } = &target {
        params
            .entry("SESSION")
            .or_insert_with(|| Value::from(*session_id));
    }
    let spec = OperationSpec::new(op_type, module_name.clone(), lane, module_name, target)
        .with_params(params);
    into_handle(RawModuleOperation::new(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_unknown() {
        let catalog = OperationCatalog::with_builtin();
        let err = catalog
            .create("nope", OperationTarget::None, Map::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, ExecError::UnknownOperation("nope".into()));
    }

    #[tokio::test]
    async fn test_raw_factory_reads_module_fields() {
        let catalog = OperationCatalog::with_builtin();
        let mut params = Map::new();
        params.insert("MODULE_NAME".into(), Value::from("multi/gather/info"));
        params.insert("DEPTH".into(), Value::from(2));
        let handle = catalog
            .create(
                "raw",
                OperationTarget::Session {
                    session_id: 4,
                    host_id: None,
                },
                params,
            )
            .await
            .unwrap();
        let op = handle.lock().await;
        let spec = op.spec();
        assert_eq!(spec.op_type, "post");
        assert_eq!(spec.module_name, "multi/gather/info");
        assert_eq!(spec.lane, "post_msf_job");
        assert_eq!(spec.param("SESSION"), Some(&Value::from(4)));
        assert_eq!(spec.param("DEPTH"), Some(&Value::from(2)));
        assert!(spec.param("MODULE_NAME").is_none());
    }

    #[tokio::test]
    async fn test_author_copied_from_meta() {
        let mut catalog = OperationCatalog::new();
        catalog.register(
            "raw",
            OperationMeta {
                author: Some("viper".into()),
                description: String::new(),
            },
            raw_factory,
        );
        let handle = catalog
            .create("raw", OperationTarget::None, Map::new())
            .await
            .unwrap();
        assert_eq!(handle.lock().await.spec().author.as_deref(), Some("viper"));
        assert_eq!(catalog.names(), vec!["raw".to_string()]);
    }
}
