//! Modexec - 渗透框架模块执行与回调关联引擎
//!
//! 模块划分：
//! - **broker**: 执行代理（同步执行 / 后台 job 提交并登记）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与引擎装配
//! - **correlator**: 订阅消息（result / heartbeat / log）的关联与分发
//! - **dispatcher**: 执行通道路由、批量提交、定时任务执行器
//! - **history**: 模块结果历史记录
//! - **notice**: 用户通知
//! - **observability**: 日志初始化
//! - **operation**: 模块接口与模块目录
//! - **registry**: 待回调任务登记表
//! - **rpc**: 渗透服务 RPC 客户端抽象与实现

pub mod broker;
pub mod config;
pub mod core;
pub mod correlator;
pub mod dispatcher;
pub mod history;
pub mod notice;
pub mod observability;
pub mod operation;
pub mod registry;
pub mod rpc;

pub use crate::core::{Engine, ExecError, RegistryError};
pub use correlator::{CallbackCorrelator, CallbackOutcome, Channel, InboundMessage};
pub use registry::{PendingTask, PendingTaskRegistry};
