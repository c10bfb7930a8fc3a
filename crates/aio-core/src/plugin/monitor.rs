//! 流量与连接计数插件。
//!
//! # 设计背景（Why）
//! - 运维需要按时间窗口观察吞吐、处理量与在线连接数，而这些数字散落在读写与处理的各个拦截点；
//! - 计数只做原子累加，不持锁，热路径开销可以忽略。
//!
//! # 契约说明（What）
//! - [`MonitorPlugin::snapshot`] 读取累计值，不清零；
//! - [`MonitorPlugin::take_window`] 读取并清零窗口计数，`online` 为即时值不参与清零；
//! - 启用 `runtime-tokio` 时可用 [`MonitorPlugin::spawn_reporter`] 按固定周期输出 `tracing` 日志。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::connection::ConnectionContext;
use crate::error::CoreError;
use crate::protocol::{Packet, StateEvent};

use super::Plugin;

/// 一次计数读数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub inflow_bytes: u64,
    pub outflow_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub decoded: u64,
    pub processed: u64,
    pub process_failures: u64,
    pub new_connections: u64,
    pub closed_connections: u64,
    /// 当前在线连接数。
    pub online: i64,
}

#[derive(Debug, Default)]
pub struct MonitorPlugin {
    inflow_bytes: AtomicU64,
    outflow_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    decoded: AtomicU64,
    processed: AtomicU64,
    process_failures: AtomicU64,
    new_connections: AtomicU64,
    closed_connections: AtomicU64,
    online: AtomicI64,
}

impl MonitorPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.read_with(|counter| counter.load(Ordering::Relaxed))
    }

    /// 读取并清零窗口计数。
    pub fn take_window(&self) -> MonitorSnapshot {
        self.read_with(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn read_with(&self, read: impl Fn(&AtomicU64) -> u64) -> MonitorSnapshot {
        MonitorSnapshot {
            inflow_bytes: read(&self.inflow_bytes),
            outflow_bytes: read(&self.outflow_bytes),
            reads: read(&self.reads),
            writes: read(&self.writes),
            decoded: read(&self.decoded),
            processed: read(&self.processed),
            process_failures: read(&self.process_failures),
            new_connections: read(&self.new_connections),
            closed_connections: read(&self.closed_connections),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    /// 在 Tokio 运行时上启动周期汇报任务；返回的句柄被中止或运行时关闭时停止。
    #[cfg(feature = "runtime-tokio")]
    pub fn spawn_reporter(
        self: std::sync::Arc<Self>,
        handle: &tokio::runtime::Handle,
        period: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let window = self.take_window();
                tracing::info!(
                    period_ms = period.as_millis() as u64,
                    inflow_bytes = window.inflow_bytes,
                    outflow_bytes = window.outflow_bytes,
                    reads = window.reads,
                    writes = window.writes,
                    decoded = window.decoded,
                    processed = window.processed,
                    process_failures = window.process_failures,
                    new_connections = window.new_connections,
                    closed_connections = window.closed_connections,
                    online = window.online,
                    "kernel traffic window"
                );
            }
        })
    }
}

impl Plugin for MonitorPlugin {
    fn after_read(&self, _ctx: &ConnectionContext, size: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inflow_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn after_decode(&self, _ctx: &ConnectionContext, _packet: &Packet) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    fn before_process(&self, _ctx: &ConnectionContext, _packet: &Packet) -> bool {
        self.processed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn after_write(&self, _ctx: &ConnectionContext, size: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.outflow_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn on_state_event(&self, _ctx: &ConnectionContext, event: StateEvent, _error: Option<&CoreError>) {
        match event {
            StateEvent::NewConnection => {
                self.new_connections.fetch_add(1, Ordering::Relaxed);
                self.online.fetch_add(1, Ordering::Relaxed);
            }
            StateEvent::Closed => {
                self.closed_connections.fetch_add(1, Ordering::Relaxed);
                self.online.fetch_sub(1, Ordering::Relaxed);
            }
            StateEvent::ProcessException => {
                self.process_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}
