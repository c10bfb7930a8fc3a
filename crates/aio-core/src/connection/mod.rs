//! 连接上下文：一条活跃网络连接的协议绑定、生命周期、输出暂存与两条有序流水线。
//!
//! # 模块定位（Why）
//! - 连接由 IO 完成回调与协议处理器共同驱动，二者运行在共享执行器的任意线程上；
//! - 每条连接的解码与处理各由一个 [`OrderedRunner`] 串行化，连接之间互不阻塞。
//!
//! # 文件划分（How）
//! - 本文件：构建、状态机、关闭流程与访问器；
//! - `output`：编码写入、分片封装与刷写协议；
//! - `input`：读完成入口、未解码字节累积与解码/处理两阶段。
//!
//! # 生命周期（What）
//! - `Enabled → Closing → Closed`，立即关闭可跳过 `Closing`；`Closed` 为终态；
//! - 进入 `Closed` 的那次转换恰好执行一次资源回收：关闭刷写队列、取消并等待两个执行器、
//!   归还全部租约、关闭传输层、广播 `Closing`/`Closed` 事件；
//! - 非 `Enabled` 状态下的 `send`/读入口返回 `connection.closed`，不会抛进 IO 回调。

mod input;
mod output;

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use aio_buffer::{BufferPagePool, Lease};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::KernelConfig;
use crate::error::{CoreError, codes};
use crate::protocol::{DispatchChain, StateEvent};
use crate::queue::{BoundedQueue, QueuePolicy};
use crate::runtime::{Executor, OrderedRunner};

use input::{ReadEvent, Work};
pub use output::{OutboundChunk, OutboundSink, OutputWriter};

const ENABLED: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// 连接生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Enabled,
    Closing,
    Closed,
}

type AnyValue = Arc<dyn Any + Send + Sync>;

/// 连接上下文句柄，`Clone` 只增加引用计数。
#[derive(Clone)]
pub struct ConnectionContext {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    serial: u64,
    id: ArcSwapOption<String>,
    protocol: OnceLock<usize>,
    status: AtomicU8,
    chain: Arc<DispatchChain>,
    pool: BufferPagePool,
    config: Arc<KernelConfig>,
    sink: Arc<dyn OutboundSink>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    /// 输出暂存租约；编码期间持有此锁，保证并发 `send` 的字节不交错。
    staging: Mutex<Option<Lease>>,
    flush_queue: BoundedQueue<OutboundChunk>,
    writing: AtomicBool,
    /// 优雅关闭已完成暂存封装，刷写排空后即可进入 `Closed`。
    drain_ready: AtomicBool,
    /// 未解码字节累积区。
    pending: Mutex<Option<Lease>>,
    decode_runner: OrderedRunner<ReadEvent>,
    handle_runner: OrderedRunner<Work>,
    attachment: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    attrs: DashMap<String, AnyValue>,
}

/// 连接上下文构建器。
///
/// 传输层在接入或建连成功后调用；`build` 立即创建执行器与队列，并广播 `NewConnection`。
pub struct ConnectionBuilder {
    chain: Arc<DispatchChain>,
    pool: BufferPagePool,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn OutboundSink>,
    config: Arc<KernelConfig>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    protocol: Option<String>,
}

impl ConnectionBuilder {
    pub fn new(
        chain: Arc<DispatchChain>,
        pool: BufferPagePool,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn OutboundSink>,
    ) -> Self {
        Self {
            chain,
            pool,
            executor,
            sink,
            config: Arc::new(KernelConfig::default()),
            local_addr: None,
            peer_addr: None,
            protocol: None,
        }
    }

    pub fn config(mut self, config: impl Into<Arc<KernelConfig>>) -> Self {
        self.config = config.into();
        self
    }

    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// 预先绑定协议，`NewConnection` 事件将直接交给该协议。客户端通常需要这样做。
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocol = Some(name.into());
        self
    }

    pub fn build(self) -> Result<ConnectionContext, CoreError> {
        let config = self.config;
        config.validate()?;
        let page_size = self.pool.config().page_size;
        if config.write_chunk_size > page_size || config.max_pending_read_bytes > page_size {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                format!("kernel buffer sizes exceed the shared pool page size {page_size}"),
            ));
        }
        let bound = match &self.protocol {
            Some(name) => Some(self.chain.protocol_index(name).ok_or_else(|| {
                CoreError::new(codes::PROTOCOL_UNKNOWN, format!("protocol `{name}` is not registered"))
            })?),
            None => None,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<ConnectionInner>| {
            let on_segment = weak.clone();
            let decode_runner = OrderedRunner::new(
                Arc::clone(&self.executor),
                config.max_wait_num,
                QueuePolicy::Wait,
                config.max_batch,
                move |event: ReadEvent| {
                    if let Some(ctx) = ConnectionContext::upgrade(&on_segment) {
                        ctx.on_read_event(event);
                    }
                },
            );
            let on_packet = weak.clone();
            let handle_runner = OrderedRunner::new(
                Arc::clone(&self.executor),
                config.max_wait_num,
                QueuePolicy::Wait,
                config.max_batch,
                move |work: Work| {
                    if let Some(ctx) = ConnectionContext::upgrade(&on_packet) {
                        ctx.on_work(work);
                    }
                },
            );
            let on_ready = weak.clone();
            let flush_queue = BoundedQueue::new(config.write_queue_capacity, QueuePolicy::Wait)
                .with_notify(move || {
                    if let Some(ctx) = ConnectionContext::upgrade(&on_ready) {
                        ctx.pump();
                    }
                });

            let protocol = OnceLock::new();
            if let Some(index) = bound {
                let _ = protocol.set(index);
            }

            ConnectionInner {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                id: ArcSwapOption::empty(),
                protocol,
                status: AtomicU8::new(ENABLED),
                chain: self.chain,
                pool: self.pool,
                config: Arc::clone(&config),
                sink: self.sink,
                local_addr: self.local_addr,
                peer_addr: self.peer_addr,
                staging: Mutex::new(None),
                flush_queue,
                writing: AtomicBool::new(false),
                drain_ready: AtomicBool::new(false),
                pending: Mutex::new(None),
                decode_runner,
                handle_runner,
                attachment: Mutex::new(None),
                attrs: DashMap::new(),
            }
        });

        let ctx = ConnectionContext { inner };
        tracing::debug!(
            connection = ctx.serial(),
            peer = ?ctx.peer_addr(),
            "connection opened"
        );
        ctx.notify(StateEvent::NewConnection, None);
        Ok(ctx)
    }
}

impl ConnectionContext {
    fn upgrade(weak: &Weak<ConnectionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// 进程内唯一的连接序号。
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// 用户绑定的业务 ID。
    pub fn id(&self) -> Option<Arc<String>> {
        self.inner.id.load_full()
    }

    /// 绑定（或覆盖）业务 ID。
    pub fn bind_id(&self, id: impl Into<String>) {
        self.inner.id.store(Some(Arc::new(id.into())));
    }

    /// 按名称绑定协议。只能成功一次，之后的调用返回 `Ok(false)` 且不改变绑定。
    pub fn bind_protocol(&self, name: &str) -> Result<bool, CoreError> {
        let index = self.inner.chain.protocol_index(name).ok_or_else(|| {
            CoreError::new(codes::PROTOCOL_UNKNOWN, format!("protocol `{name}` is not registered"))
        })?;
        Ok(self.bind_index(index))
    }

    pub(crate) fn bind_index(&self, index: usize) -> bool {
        self.inner.protocol.set(index).is_ok()
    }

    pub(crate) fn protocol_index(&self) -> Option<usize> {
        self.inner.protocol.get().copied()
    }

    /// 已绑定的协议名。
    pub fn protocol(&self) -> Option<&str> {
        self.protocol_index()
            .map(|index| self.inner.chain.protocol_at(index).name())
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.inner.status.load(Ordering::Acquire) {
            ENABLED => ConnectionStatus::Enabled,
            CLOSING => ConnectionStatus::Closing,
            _ => ConnectionStatus::Closed,
        }
    }

    /// 连接是否已离开 `Enabled`。
    pub fn is_invalid(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) != ENABLED
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &BufferPagePool {
        &self.inner.pool
    }

    pub fn chain(&self) -> &Arc<DispatchChain> {
        &self.inner.chain
    }

    /// 设置附件，覆盖旧值。
    pub fn set_attachment<A: Any + Send + Sync>(&self, value: A) {
        *self.inner.attachment.lock() = Some(Box::new(value));
    }

    /// 克隆读取附件；类型不符或未设置时返回 `None`。
    pub fn attachment<A: Any + Send + Sync + Clone>(&self) -> Option<A> {
        self.inner
            .attachment
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<A>())
            .cloned()
    }

    /// 就地修改附件。
    pub fn with_attachment<A: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        self.inner
            .attachment
            .lock()
            .as_mut()
            .and_then(|value| value.downcast_mut::<A>())
            .map(f)
    }

    /// 取走附件；类型不符时保持原值。
    pub fn take_attachment<A: Any + Send + Sync>(&self) -> Option<A> {
        let mut slot = self.inner.attachment.lock();
        match slot.take()?.downcast::<A>() {
            Ok(value) => Some(*value),
            Err(original) => {
                *slot = Some(original);
                None
            }
        }
    }

    /// 写入属性。
    pub fn set_attr<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.inner.attrs.insert(key.into(), Arc::new(value));
    }

    /// 克隆读取属性；类型不符或不存在时返回 `None`。
    pub fn attr<V: Any + Send + Sync + Clone>(&self, key: &str) -> Option<V> {
        self.inner
            .attrs
            .get(key)
            .and_then(|entry| entry.value().as_ref().downcast_ref::<V>().cloned())
    }

    pub fn remove_attr(&self, key: &str) -> bool {
        self.inner.attrs.remove(key).is_some()
    }

    /// 关闭连接。
    ///
    /// - `immediate == true`：直接进入 `Closed` 并回收资源；对处于 `Closing` 的连接同样生效，
    ///   用于优雅关闭途中遇到写失败等需要放弃排空的场景；
    /// - `immediate == false`：进入 `Closing`，取消解码/处理执行器，封装暂存输出，待已排队的
    ///   输出全部写完后再进入 `Closed`；
    /// - 其余情况（重复关闭）为空操作。
    pub fn close(&self, immediate: bool) {
        let status = &self.inner.status;
        if immediate {
            if status
                .compare_exchange(ENABLED, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.teardown(true);
            } else if status
                .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.teardown(false);
            }
            return;
        }

        if status
            .compare_exchange(ENABLED, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(connection = self.serial(), "connection closing");
        self.notify(StateEvent::Closing, None);
        self.inner.decode_runner.cancel();
        self.inner.handle_runner.cancel();
        {
            let mut staging = self.inner.staging.lock();
            // 刷写队列只会在 `teardown` 中关闭，此时已无需排空。
            let _ = self.seal(&mut staging);
        }
        self.inner.drain_ready.store(true, Ordering::Release);
        self.pump();
    }

    /// 优雅关闭的收尾：输出排空且没有在途写时进入 `Closed`。
    fn finish_draining(&self) {
        let inner = &self.inner;
        if inner.status.load(Ordering::Acquire) != CLOSING
            || !inner.drain_ready.load(Ordering::Acquire)
            || inner.writing.load(Ordering::Acquire)
            || !inner.flush_queue.is_empty()
        {
            return;
        }
        if inner
            .status
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.teardown(false);
        }
    }

    /// 进入 `Closed` 后的唯一一次资源回收。
    ///
    /// 顺序不可调换：先关闭刷写队列，阻塞在满队列上的 `send` 才会返回并释放输出锁；
    /// 再取消并等待执行器，确保之后不会再有解码/处理回调触碰即将归还的租约。
    fn teardown(&self, announce_closing: bool) {
        let inner = &self.inner;
        inner.flush_queue.close();
        inner.decode_runner.cancel();
        inner.handle_runner.cancel();
        inner.decode_runner.join();
        inner.handle_runner.join();

        drop(inner.staging.lock().take());
        inner.flush_queue.clear();
        drop(inner.pending.lock().take());
        inner.sink.shutdown();

        tracing::debug!(connection = self.serial(), "connection closed");
        if announce_closing {
            self.notify(StateEvent::Closing, None);
        }
        self.notify(StateEvent::Closed, None);
    }

    pub(crate) fn notify(&self, event: StateEvent, error: Option<&CoreError>) {
        self.inner.chain.notify_state(self, event, error);
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("serial", &self.serial())
            .field("protocol", &self.protocol())
            .field("status", &self.status())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::CoreError;
    use crate::protocol::{DecodeOutcome, Packet, ProtocolHandler, ReadCursor};
    use aio_buffer::PoolConfig;
    use std::sync::mpsc;

    /// 同步执行器：任务在独立线程上运行，满足“不在调用线程上同步执行”的契约。
    pub(crate) struct ThreadExecutor;

    impl Executor for ThreadExecutor {
        fn execute(&self, task: crate::runtime::Task) {
            std::thread::spawn(task);
        }
    }

    /// 记录写出字节的输出端；写完成由后台线程回报。
    pub(crate) struct RecordingSink {
        pub(crate) sender: Mutex<Option<mpsc::Sender<OutboundChunk>>>,
        pub(crate) shutdowns: std::sync::atomic::AtomicUsize,
    }

    impl OutboundSink for RecordingSink {
        fn write(&self, chunk: OutboundChunk) {
            if let Some(sender) = self.sender.lock().as_ref() {
                let _ = sender.send(chunk);
            }
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 以 `u8` 长度前缀 + 原始字节为帧的最小协议，回显收到的帧。
    pub(crate) struct EchoBytes;

    impl ProtocolHandler for EchoBytes {
        fn name(&self) -> &str {
            "echo-bytes"
        }

        fn decode(
            &self,
            cursor: &mut ReadCursor<'_>,
            _ctx: &ConnectionContext,
        ) -> Result<DecodeOutcome, CoreError> {
            let Some(len) = cursor.get_u8() else {
                return Ok(DecodeOutcome::Incomplete);
            };
            match cursor.take(len as usize) {
                Some(body) => Ok(DecodeOutcome::Complete(Packet::new(body.to_vec()))),
                None => Ok(DecodeOutcome::Incomplete),
            }
        }

        fn handle(
            &self,
            _ctx: &ConnectionContext,
            packet: Packet,
        ) -> Result<Option<Packet>, CoreError> {
            Ok(Some(packet))
        }

        fn encode(
            &self,
            packet: &Packet,
            out: &mut OutputWriter<'_>,
            _ctx: &ConnectionContext,
        ) -> Result<(), CoreError> {
            let body = packet
                .downcast_ref::<Vec<u8>>()
                .ok_or_else(|| CoreError::new(crate::error::codes::PROTOCOL_ENCODE, "not bytes"))?;
            out.put_u8(body.len() as u8)?;
            out.put_slice(body)
        }
    }

    pub(crate) fn pool() -> BufferPagePool {
        BufferPagePool::new(PoolConfig {
            page_size: 64 * 1024,
            initial_pages: 1,
            max_pages: 4,
        })
        .expect("构建内存池失败")
    }

    pub(crate) fn small_config() -> KernelConfig {
        KernelConfig {
            read_buffer_size: 64,
            write_chunk_size: 32,
            write_queue_capacity: 4,
            max_wait_num: 64,
            max_batch: 8,
            max_pending_read_bytes: 1024,
            pool: PoolConfig {
                page_size: 64 * 1024,
                initial_pages: 1,
                max_pages: 4,
            },
        }
    }

    /// 构建连接并启动回报写完成的后台线程，返回写出字节的接收端。
    pub(crate) fn connect(
        chain: Arc<DispatchChain>,
        pool: &BufferPagePool,
    ) -> (ConnectionContext, mpsc::Receiver<Vec<u8>>, Arc<RecordingSink>) {
        let (chunk_tx, chunk_rx) = mpsc::channel::<OutboundChunk>();
        let sink = Arc::new(RecordingSink {
            sender: Mutex::new(Some(chunk_tx)),
            shutdowns: std::sync::atomic::AtomicUsize::new(0),
        });
        let ctx = ConnectionBuilder::new(
            chain,
            pool.clone(),
            Arc::new(ThreadExecutor),
            Arc::clone(&sink) as Arc<dyn OutboundSink>,
        )
        .config(small_config())
        .build()
        .expect("构建连接失败");

        let (bytes_tx, bytes_rx) = mpsc::channel();
        let writer = ctx.clone();
        std::thread::spawn(move || {
            while let Ok(chunk) = chunk_rx.recv() {
                let _ = bytes_tx.send(chunk.bytes().to_vec());
                writer.write_completed(chunk);
            }
        });
        (ctx, bytes_rx, sink)
    }
}
