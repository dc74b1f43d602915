//! 通用透传模块：直接执行渗透服务模块，回调时原样记录状态、消息与数据

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::operation::{Operation, OperationOutput, OperationSpec, OperationTarget};

/// 透传模块
#[derive(Debug, Clone)]
pub struct RawModuleOperation {
    spec: OperationSpec,
    output: OperationOutput,
}

impl RawModuleOperation {
    pub fn new(spec: OperationSpec) -> Self {
        Self {
            spec,
            output: OperationOutput::new(),
        }
    }

    /// 以 Session 为目标构造；params 中自动补充 SESSION
    pub fn for_session(
        op_type: &str,
        module_name: &str,
        lane: &str,
        session_id: i64,
        mut params: Map<String, Value>,
    ) -> Self {
        params
            .entry("SESSION")
            .or_insert_with(|| Value::from(session_id));
        let spec = OperationSpec::new(
            op_type,
            module_name,
            lane,
            module_name,
            OperationTarget::Session {
                session_id,
                host_id: None,
            },
        )
        .with_params(params);
        Self::new(spec)
    }
}

#[async_trait]
impl Operation for RawModuleOperation {
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

    async fn callback(
        &mut self,
        status: bool,
        message: Option<String>,
        data: Value,
    ) -> Result<(), String> {
        if status {
            self.output
                .log_good(format!("{} finished", self.spec.display_name));
        } else {
            self.output
                .log_error(format!("{} failed", self.spec.display_name));
        }
        if let Some(message) = message {
            self.output.log_info(message);
        }
        self.output.set_result(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::NoticeLevel;

    #[tokio::test]
    async fn test_raw_callback_records_result() {
        let mut op = RawModuleOperation::for_session(
            "post",
            "multi/gather/info",
            "post_msf_job",
            7,
            Map::new(),
        );
        assert_eq!(op.spec().param("SESSION"), Some(&Value::from(7)));

        op.callback(false, Some("access denied".into()), serde_json::json!({}))
            .await
            .unwrap();
        let lines = op.output().lines();
        assert_eq!(lines[0].level, NoticeLevel::Error);
        assert_eq!(lines[1].text, "access denied");
        assert_eq!(op.output().result(), Some(&serde_json::json!({})));

        op.clean_log();
        assert!(op.output().is_empty());
    }
}
