//! Modexec - 模块执行与回调关联引擎
//!
//! 入口：初始化日志、加载配置、装配引擎，启动定时任务执行器、过期回收与回调监听；
//! 订阅消息以行分隔 JSON（`{"channel": "result", "data": "..."}`）从标准输入读入。

use std::sync::Arc;

use anyhow::Context;
use modexec::config::{load_config, AppConfig};
use modexec::correlator::ChannelMessage;
use modexec::dispatcher::ScheduledWorker;
use modexec::{observability, Engine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = match load_config(std::env::args().nth(1).map(Into::into)) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };
    let max_concurrent = config.worker.max_concurrent;

    let (engine, queue_rx) = Engine::from_config(config).await;
    let token = CancellationToken::new();

    let worker = ScheduledWorker::new(
        Arc::clone(engine.history()),
        Arc::clone(engine.notifier()),
        max_concurrent,
    );
    let worker_handle = tokio::spawn(worker.start(queue_rx));
    let sweeper_handle = engine.spawn_sweeper(token.clone());

    let (msg_tx, msg_rx) = mpsc::channel(256);
    let listener_handle = tokio::spawn(engine.listener().run(msg_rx, token.clone()));

    tracing::info!(rpc = %engine.config().rpc.url, "Modexec started, reading subscription messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChannelMessage>(&line) {
            Ok(msg) => {
                if msg_tx.send((msg.channel, msg.message)).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Skipping malformed subscription line: {}", e),
        }
    }

    // 关闭发送端，让监听器处理完已收到的消息
    drop(msg_tx);
    let dispatched = listener_handle.await.context("Listener task failed")?;
    token.cancel();
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    worker_handle.abort();
    tracing::info!(dispatched, pending = engine.registry().len().await, "Modexec stopped");

    Ok(())
}
