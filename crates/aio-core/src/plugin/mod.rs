//! 插件拦截点：接入过滤、读写前后、编解码前后与状态事件。
//!
//! 插件与协议无关：无论连接最终绑定哪种协议，所有插件都按注册顺序观察它的每一个事件。
//! 所有钩子都有空实现，插件只覆盖自己关心的部分。

pub mod monitor;

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::ConnectionContext;
use crate::error::CoreError;
use crate::protocol::{Packet, StateEvent};

pub use monitor::{MonitorPlugin, MonitorSnapshot};

/// 连接接入前可被插件改写的套接字选项；`None` 表示保持系统默认。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub nodelay: Option<bool>,
    pub keepalive: Option<bool>,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub linger: Option<Duration>,
}

/// 接入过滤上下文：此时连接上下文尚未创建，插件只能看到地址并调整套接字选项。
#[derive(Debug, Clone)]
pub struct AcceptContext {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    pub options: SocketOptions,
}

impl AcceptContext {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
            options: SocketOptions::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// 插件契约。
///
/// # 契约说明（What）
/// - `should_accept`：任一插件返回 `false` 即拒绝该连接，后续插件不再调用；
/// - `before_process`：所有插件都会被调用，任一返回 `false` 则该数据单元不交给协议处理；
/// - 其余钩子只用于观察，不影响数据流；
/// - 钩子在 IO 完成或执行器线程上同步调用，不得阻塞。
pub trait Plugin: Send + Sync + 'static {
    fn should_accept(&self, _accept: &mut AcceptContext) -> bool {
        true
    }

    fn before_read(&self, _ctx: &ConnectionContext) {}

    fn after_read(&self, _ctx: &ConnectionContext, _size: usize) {}

    fn before_decode(&self, _ctx: &ConnectionContext, _pending: usize) {}

    fn after_decode(&self, _ctx: &ConnectionContext, _packet: &Packet) {}

    fn before_process(&self, _ctx: &ConnectionContext, _packet: &Packet) -> bool {
        true
    }

    fn before_encode(&self, _ctx: &ConnectionContext, _packet: &Packet) {}

    fn after_encode(&self, _ctx: &ConnectionContext, _packet: &Packet, _written: usize) {}

    fn before_write(&self, _ctx: &ConnectionContext, _size: usize) {}

    fn after_write(&self, _ctx: &ConnectionContext, _size: usize) {}

    fn on_state_event(
        &self,
        _ctx: &ConnectionContext,
        _event: StateEvent,
        _error: Option<&CoreError>,
    ) {
    }
}
