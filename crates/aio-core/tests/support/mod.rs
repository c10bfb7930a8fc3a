//! 集成测试共用的夹具：通道式输出端、定长整数协议与连接构建辅助。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use aio_core::aio_buffer::{BufferPagePool, PoolConfig};
use aio_core::{
    ConnectionBuilder, ConnectionContext, CoreError, DecodeOutcome, DispatchChain, Executor,
    KernelConfig, OutboundChunk, OutboundSink, OutputWriter, Packet, ProtocolHandler, ReadCursor,
};
use parking_lot::Mutex;

/// 把分片交给后台线程的输出端；`shutdown` 丢弃发送端，后台线程随之退出。
pub struct ChannelSink {
    sender: Mutex<Option<mpsc::Sender<OutboundChunk>>>,
}

impl OutboundSink for ChannelSink {
    fn write(&self, chunk: OutboundChunk) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(chunk);
        }
    }

    fn shutdown(&self) {
        self.sender.lock().take();
    }
}

type OnUnit = dyn Fn(&ConnectionContext, u32) -> Result<Option<u32>, CoreError> + Send + Sync;

/// 4 字节大端整数为一帧的协议；`handle` 交给测试提供的闭包。
pub struct U32Frames {
    on_unit: Box<OnUnit>,
}

impl U32Frames {
    pub fn new(
        on_unit: impl Fn(&ConnectionContext, u32) -> Result<Option<u32>, CoreError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            on_unit: Box::new(on_unit),
        }
    }
}

impl ProtocolHandler for U32Frames {
    fn name(&self) -> &str {
        "u32"
    }

    fn decode(
        &self,
        cursor: &mut ReadCursor<'_>,
        _ctx: &ConnectionContext,
    ) -> Result<DecodeOutcome, CoreError> {
        Ok(match cursor.get_u32() {
            Some(value) => DecodeOutcome::Complete(Packet::new(value)),
            None => DecodeOutcome::Incomplete,
        })
    }

    fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<Option<Packet>, CoreError> {
        let value = packet
            .downcast::<u32>()
            .map_err(|_| CoreError::new(aio_core::codes::APP_PROCESS_FAILED, "not a u32"))?;
        Ok((self.on_unit)(ctx, value)?.map(Packet::new))
    }

    fn encode(
        &self,
        packet: &Packet,
        out: &mut OutputWriter<'_>,
        _ctx: &ConnectionContext,
    ) -> Result<(), CoreError> {
        let value = packet
            .downcast_ref::<u32>()
            .ok_or_else(|| CoreError::new(aio_core::codes::PROTOCOL_ENCODE, "not a u32"))?;
        out.put_u32(*value)
    }
}

pub fn pool() -> BufferPagePool {
    BufferPagePool::new(PoolConfig {
        page_size: 256 * 1024,
        initial_pages: 1,
        max_pages: 8,
    })
    .expect("构建内存池失败")
}

pub fn config() -> KernelConfig {
    KernelConfig {
        read_buffer_size: 256,
        write_chunk_size: 512,
        write_queue_capacity: 8,
        max_wait_num: 256,
        max_batch: 16,
        max_pending_read_bytes: 4096,
        pool: PoolConfig {
            page_size: 256 * 1024,
            initial_pages: 1,
            max_pages: 8,
        },
    }
}

/// 构建连接并启动回报写完成的后台线程，返回写出字节的接收端。
pub fn connect(
    chain: Arc<DispatchChain>,
    pool: &BufferPagePool,
    executor: Arc<dyn Executor>,
) -> (ConnectionContext, mpsc::Receiver<Vec<u8>>) {
    let (chunk_tx, chunk_rx) = mpsc::channel::<OutboundChunk>();
    let sink = Arc::new(ChannelSink {
        sender: Mutex::new(Some(chunk_tx)),
    });
    let ctx = ConnectionBuilder::new(chain, pool.clone(), executor, sink)
        .config(config())
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
    (ctx, bytes_rx)
}

/// 轮询等待条件成立，超时返回 `false`。
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

pub fn frames(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    values
        .into_iter()
        .flat_map(|value| value.to_be_bytes())
        .collect()
}
