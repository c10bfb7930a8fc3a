use std::sync::Arc;

use aio_core::aio_buffer::BufferPagePool;
use aio_core::{
    ConnectionBuilder, ConnectionContext, ConnectionStatus, CoreError, DispatchChain, Executor,
    KernelConfig, OutboundChunk, OutboundSink,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};

use crate::error::{CONFIGURE, READ, WRITE, map_io_error};

/// 服务端与客户端共用的连接装配参数。
#[derive(Clone)]
pub(crate) struct Wiring {
    pub chain: Arc<DispatchChain>,
    pub pool: BufferPagePool,
    pub config: Arc<KernelConfig>,
    pub executor: Arc<dyn Executor>,
}

/// 连接内核的 TCP 写出端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 内核要求 `write` 立即返回、写完成异步回报；无界通道把分片交给专职写任务，
///   内核的 `writing` 标志已保证通道里至多一个分片，“无界”不会积压。
///
/// ## 逻辑 (How)
/// - `shutdown` 丢弃发送端，写任务取完剩余分片后关闭写半部；同时广播停止信号，
///   读任务随之退出。
pub(crate) struct TcpSink {
    tx: Mutex<Option<mpsc::UnboundedSender<OutboundChunk>>>,
    stop: watch::Sender<bool>,
}

impl OutboundSink for TcpSink {
    fn write(&self, chunk: OutboundChunk) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // 写任务已退出时分片随错误一起析构，租约归还。
            let _ = tx.send(chunk);
        }
    }

    fn shutdown(&self) {
        self.tx.lock().take();
        self.stop.send_replace(true);
    }
}

/// 为已建立的套接字创建连接上下文，并启动读写任务。
pub(crate) fn open(
    stream: TcpStream,
    wiring: &Wiring,
    protocol: Option<&str>,
) -> Result<ConnectionContext, CoreError> {
    let local_addr = stream
        .local_addr()
        .map_err(|err| map_io_error(CONFIGURE, err))?;
    let peer_addr = stream
        .peer_addr()
        .map_err(|err| map_io_error(CONFIGURE, err))?;
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (stop, stopped) = watch::channel(false);
    let sink = Arc::new(TcpSink {
        tx: Mutex::new(Some(tx)),
        stop,
    });

    let mut builder = ConnectionBuilder::new(
        Arc::clone(&wiring.chain),
        wiring.pool.clone(),
        Arc::clone(&wiring.executor),
        sink,
    )
    .config(Arc::clone(&wiring.config))
    .local_addr(local_addr)
    .peer_addr(peer_addr);
    if let Some(name) = protocol {
        builder = builder.protocol(name);
    }
    let ctx = builder.build()?;

    tokio::spawn(write_loop(ctx.clone(), write_half, rx));
    tokio::spawn(read_loop(ctx.clone(), read_half, stopped));
    Ok(ctx)
}

/// 每次读入一个 `read_buffer_size` 的租约，直接读进租约的可写区。
async fn read_loop(ctx: ConnectionContext, mut reader: OwnedReadHalf, mut stopped: watch::Receiver<bool>) {
    let size = ctx.config().read_buffer_size;
    loop {
        ctx.before_read();
        let mut lease = match ctx.pool().allocate(size) {
            Ok(lease) => lease,
            Err(err) => {
                ctx.read_failed(err.into());
                break;
            }
        };
        let result = tokio::select! {
            _ = stopped.changed() => break,
            result = reader.read(lease.writable_mut()) => result,
        };
        match result {
            Ok(0) => {
                ctx.input_shutdown();
                break;
            }
            Ok(read) => {
                if let Err(err) = lease.advance_write(read) {
                    ctx.read_failed(err.into());
                    break;
                }
                // 解码队列满时阻塞，这是输入背压点。
                if blocking(|| ctx.read_completed(lease)).is_err() {
                    break;
                }
            }
            Err(err) => {
                ctx.read_failed(map_io_error(READ, err));
                break;
            }
        }
    }
    tracing::trace!(connection = ctx.serial(), "reader stopped");
}

async fn write_loop(
    ctx: ConnectionContext,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<OutboundChunk>,
) {
    while let Some(chunk) = rx.recv().await {
        if ctx.status() == ConnectionStatus::Closed {
            continue;
        }
        match writer.write_all(chunk.bytes()).await {
            Ok(()) => blocking(|| ctx.write_completed(chunk)),
            Err(err) => {
                let error = map_io_error(WRITE, err);
                blocking(|| ctx.write_failed(chunk, error));
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::trace!(connection = ctx.serial(), "writer stopped");
}

/// 内核回调可能阻塞（背压或关闭时等待执行器），多线程运行时上先让出工作线程。
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
