//! 协议测试共用夹具：在 Tokio 运行时上构建连接，写出的字节经后台线程回报。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use aio_core::aio_buffer::{BufferPagePool, PoolConfig};
use aio_core::{
    ConnectionBuilder, ConnectionContext, DispatchChain, KernelConfig, OutboundChunk, OutboundSink,
};
use parking_lot::Mutex;

struct ChannelSink {
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

pub struct Harness {
    pub runtime: tokio::runtime::Runtime,
    pub pool: BufferPagePool,
}

impl Harness {
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .expect("构建运行时失败");
        let pool = BufferPagePool::new(PoolConfig {
            page_size: 64 * 1024,
            initial_pages: 1,
            max_pages: 4,
        })
        .expect("构建内存池失败");
        Self { runtime, pool }
    }

    pub fn connect(&self, chain: Arc<DispatchChain>) -> (ConnectionContext, mpsc::Receiver<Vec<u8>>) {
        let (chunk_tx, chunk_rx) = mpsc::channel::<OutboundChunk>();
        let sink = Arc::new(ChannelSink {
            sender: Mutex::new(Some(chunk_tx)),
        });
        let config = KernelConfig {
            read_buffer_size: 64,
            write_chunk_size: 256,
            max_pending_read_bytes: 4096,
            pool: *self.pool.config(),
            ..KernelConfig::default()
        };
        let ctx = ConnectionBuilder::new(
            chain,
            self.pool.clone(),
            Arc::new(self.runtime.handle().clone()),
            sink,
        )
        .config(config)
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

    /// 把字节装进池租约，模拟一次读完成。
    pub fn deliver(&self, ctx: &ConnectionContext, bytes: &[u8]) {
        let mut lease = self.pool.allocate(bytes.len()).expect("租借失败");
        lease.put_slice(bytes).expect("写入租约失败");
        ctx.read_completed(lease).expect("连接已关闭");
    }
}

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

pub fn string_frame(text: &str) -> Vec<u8> {
    let mut frame = (text.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(text.as_bytes());
    frame
}
