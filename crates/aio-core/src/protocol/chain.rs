use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::connection::ConnectionContext;
use crate::error::{CoreError, codes};
use crate::plugin::{AcceptContext, Plugin};
use crate::protocol::{DecodeOutcome, Packet, ProtocolHandler, ReadCursor, StateEvent};

/// 协议分发链：启动时构建、之后只读的协议注册表与插件列表。
///
/// # 设计背景（Why）
/// - 注册表在服务开始前一次性确定，之后被所有工作线程并发读取；构建完成即冻结为 `Arc`，
///   读取路径不需要任何锁；
/// - 以切片按下标顺序迭代协议，连接绑定协议后只记录下标。
///
/// # 核心机制（How）
/// - 未绑定的连接按注册顺序逐个试探；每次试探前记录游标位置，返回 `Incomplete` 或错误时恢复，
///   从结构上保证试探是非破坏性的；
/// - 首个返回 `Complete` 的协议被绑定到连接（粘性），之后只调用它；
/// - `Complete` 却没有消费任何字节的解码器会让解码循环原地打转，按 `protocol.decode_stalled` 处理。
///
/// # 契约说明（What）
/// - 至少注册一个协议，且协议名互不相同；
/// - 状态事件先按注册顺序广播给所有插件，再交给绑定协议；未绑定时交给首个注册的协议。
pub struct DispatchChain {
    protocols: Vec<Arc<dyn ProtocolHandler>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

/// [`DispatchChain`] 的构建器。
#[derive(Default)]
pub struct DispatchChainBuilder {
    protocols: Vec<Arc<dyn ProtocolHandler>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl DispatchChainBuilder {
    /// 追加协议；注册顺序即试探顺序。
    pub fn protocol(mut self, handler: impl ProtocolHandler) -> Self {
        self.protocols.push(Arc::new(handler));
        self
    }

    pub fn protocol_arc(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.protocols.push(handler);
        self
    }

    /// 追加插件。
    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// 追加共享插件，调用方可保留一份 `Arc` 读取插件自身的状态（如监控计数）。
    pub fn plugin_arc(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn build(self) -> Result<Arc<DispatchChain>, CoreError> {
        if self.protocols.is_empty() {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "dispatch chain requires at least one protocol",
            ));
        }
        let mut names = HashSet::new();
        for handler in &self.protocols {
            if !names.insert(handler.name().to_owned()) {
                return Err(CoreError::new(
                    codes::CONFIG_INVALID,
                    format!("protocol `{}` registered twice", handler.name()),
                ));
            }
        }
        Ok(Arc::new(DispatchChain {
            protocols: self.protocols,
            plugins: self.plugins,
        }))
    }
}

impl DispatchChain {
    pub fn builder() -> DispatchChainBuilder {
        DispatchChainBuilder::default()
    }

    pub fn protocols(&self) -> &[Arc<dyn ProtocolHandler>] {
        &self.protocols
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// 按名称查找协议下标。
    pub fn protocol_index(&self, name: &str) -> Option<usize> {
        self.protocols
            .iter()
            .position(|handler| handler.name() == name)
    }

    pub(crate) fn protocol_at(&self, index: usize) -> &dyn ProtocolHandler {
        self.protocols[index].as_ref()
    }

    /// 接入过滤：任一插件拒绝即返回 `false`。
    pub fn should_accept(&self, accept: &mut AcceptContext) -> bool {
        self.plugins.iter().all(|plugin| plugin.should_accept(accept))
    }

    /// 解码一个数据单元；`Ok(None)` 表示数据不足。
    pub(crate) fn decode(
        &self,
        cursor: &mut ReadCursor<'_>,
        ctx: &ConnectionContext,
    ) -> Result<Option<Packet>, CoreError> {
        if let Some(index) = ctx.protocol_index() {
            return self.attempt(index, cursor, ctx);
        }
        for index in 0..self.protocols.len() {
            if let Some(packet) = self.attempt(index, cursor, ctx)? {
                if ctx.bind_index(index) {
                    tracing::debug!(
                        connection = ctx.serial(),
                        protocol = self.protocols[index].name(),
                        "protocol bound"
                    );
                }
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }

    fn attempt(
        &self,
        index: usize,
        cursor: &mut ReadCursor<'_>,
        ctx: &ConnectionContext,
    ) -> Result<Option<Packet>, CoreError> {
        let start = cursor.position();
        let handler = self.protocol_at(index);
        match handler.decode(cursor, ctx) {
            Ok(DecodeOutcome::Complete(packet)) => {
                if cursor.position() == start {
                    return Err(CoreError::new(
                        codes::PROTOCOL_DECODE_STALLED,
                        format!(
                            "protocol `{}` completed a unit without consuming input",
                            handler.name()
                        ),
                    ));
                }
                Ok(Some(packet))
            }
            Ok(DecodeOutcome::Incomplete) => {
                cursor.restore(start);
                Ok(None)
            }
            Err(err) => {
                cursor.restore(start);
                Err(err)
            }
        }
    }

    pub(crate) fn notify_state(
        &self,
        ctx: &ConnectionContext,
        event: StateEvent,
        error: Option<&CoreError>,
    ) {
        for plugin in &self.plugins {
            plugin.on_state_event(ctx, event, error);
        }
        let index = ctx.protocol_index().unwrap_or(0);
        self.protocol_at(index).on_state_event(ctx, event, error);
    }

    pub(crate) fn before_read(&self, ctx: &ConnectionContext) {
        self.plugins.iter().for_each(|plugin| plugin.before_read(ctx));
    }

    pub(crate) fn after_read(&self, ctx: &ConnectionContext, size: usize) {
        self.plugins.iter().for_each(|plugin| plugin.after_read(ctx, size));
    }

    pub(crate) fn before_decode(&self, ctx: &ConnectionContext, pending: usize) {
        self.plugins
            .iter()
            .for_each(|plugin| plugin.before_decode(ctx, pending));
    }

    pub(crate) fn after_decode(&self, ctx: &ConnectionContext, packet: &Packet) {
        self.plugins
            .iter()
            .for_each(|plugin| plugin.after_decode(ctx, packet));
    }

    /// 所有插件都会被询问，任一否决则返回 `false`。
    pub(crate) fn before_process(&self, ctx: &ConnectionContext, packet: &Packet) -> bool {
        self.plugins
            .iter()
            .fold(true, |allowed, plugin| plugin.before_process(ctx, packet) && allowed)
    }

    pub(crate) fn before_encode(&self, ctx: &ConnectionContext, packet: &Packet) {
        self.plugins
            .iter()
            .for_each(|plugin| plugin.before_encode(ctx, packet));
    }

    pub(crate) fn after_encode(&self, ctx: &ConnectionContext, packet: &Packet, written: usize) {
        self.plugins
            .iter()
            .for_each(|plugin| plugin.after_encode(ctx, packet, written));
    }

    pub(crate) fn before_write(&self, ctx: &ConnectionContext, size: usize) {
        self.plugins
            .iter()
            .for_each(|plugin| plugin.before_write(ctx, size));
    }

    pub(crate) fn after_write(&self, ctx: &ConnectionContext, size: usize) {
        self.plugins.iter().for_each(|plugin| plugin.after_write(ctx, size));
    }
}

impl fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.protocols.iter().map(|handler| handler.name()).collect();
        f.debug_struct("DispatchChain")
            .field("protocols", &names)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}
