//! 用户通知
//!
//! 所有失败最终只以通知日志的形式呈现给用户。Notifier::send 签名上不可失败：
//! 通知发送失败绝不能影响提交或回调的结果。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeLevel {
    /// 解析渗透服务日志中的级别字符串，无法识别时为 Info
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "good" | "success" => Self::Success,
            "warning" | "warn" => Self::Warning,
            "error" | "err" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoticeLevel::Info => write!(f, "info"),
            NoticeLevel::Success => write!(f, "success"),
            NoticeLevel::Warning => write!(f, "warning"),
            NoticeLevel::Error => write!(f, "error"),
        }
    }
}

/// 一条通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub content: String,
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 通知投递接口
pub trait Notifier: Send + Sync {
    fn send(&self, level: NoticeLevel, content: String);

    fn info(&self, content: String) {
        self.send(NoticeLevel::Info, content);
    }

    fn success(&self, content: String) {
        self.send(NoticeLevel::Success, content);
    }

    fn warning(&self, content: String) {
        self.send(NoticeLevel::Warning, content);
    }

    fn error(&self, content: String) {
        self.send(NoticeLevel::Error, content);
    }
}

/// 仅写入 tracing 日志
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send(&self, level: NoticeLevel, content: String) {
        match level {
            NoticeLevel::Info | NoticeLevel::Success => {
                tracing::info!(notice = %level, "{}", content)
            }
            NoticeLevel::Warning => tracing::warn!(notice = %level, "{}", content),
            NoticeLevel::Error => tracing::error!(notice = %level, "{}", content),
        }
    }
}

/// 把通知写入 mpsc 通道，由上层（Web 推送等）消费
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn send(&self, level: NoticeLevel, content: String) {
        let notice = Notice {
            level,
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        // 接收端已关闭时静默丢弃
        let _ = self.tx.send(notice);
    }
}
