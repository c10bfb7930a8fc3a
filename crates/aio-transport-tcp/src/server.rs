use std::net::SocketAddr;
use std::sync::Arc;

use aio_core::aio_buffer::BufferPagePool;
use aio_core::{AcceptContext, CoreError, DispatchChain, Executor, KernelConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{self, Wiring};
use crate::error::{ACCEPT, BIND, map_io_error};
use crate::option;

/// TCP 服务端引导。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“绑定 → 接入过滤 → 套接字选项 → 连接上下文 → 读写任务”串成一个入口，
///   协议作者只需要准备分发链。
///
/// ## 逻辑 (How)
/// - `start` 在当前 Tokio 运行时上绑定监听器并派生接入循环；
/// - 每个入站套接字先交给分发链的 `should_accept`，被拒绝的套接字只记一条 debug 日志后丢弃；
/// - 通过过滤后按插件写入的 [`SocketOptions`](aio_core::SocketOptions) 设置套接字，再装配连接。
///
/// ## 契约 (What)
/// - 必须在 Tokio 多线程运行时中调用 `start`；
/// - 未提供内存池时按 `KernelConfig::pool` 创建一个，所有连接共享。
pub struct ServerBootstrap {
    addr: SocketAddr,
    chain: Arc<DispatchChain>,
    config: KernelConfig,
    pool: Option<BufferPagePool>,
}

impl ServerBootstrap {
    pub fn new(addr: SocketAddr, chain: Arc<DispatchChain>) -> Self {
        Self {
            addr,
            chain,
            config: KernelConfig::default(),
            pool: None,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// 共享外部内存池，例如让服务端与客户端使用同一个池。
    pub fn pool(mut self, pool: BufferPagePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn start(self) -> Result<ServerHandle, CoreError> {
        self.config.validate()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => BufferPagePool::new(self.config.pool)?,
        };
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        let executor: Arc<dyn Executor> = Arc::new(tokio::runtime::Handle::current());
        let wiring = Wiring {
            chain: self.chain,
            pool,
            config: Arc::new(self.config),
            executor,
        };
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, wiring, stopped));
        tracing::info!(%local_addr, "server listening");
        Ok(ServerHandle {
            local_addr,
            stop,
            task,
        })
    }
}

/// 运行中的服务端。
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// 实际绑定的地址（端口 0 绑定后可由此取得端口）。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接入新连接并等待接入循环退出；已建立的连接不受影响。
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        let _ = self.task.await;
        tracing::info!(local_addr = %self.local_addr, "server stopped");
    }
}

async fn accept_loop(listener: TcpListener, wiring: Wiring, mut stopped: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = stopped.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                if let Err(err) = on_accept(stream, peer_addr, &wiring) {
                    tracing::warn!(%peer_addr, code = err.code(), "failed to set up connection: {err}");
                }
            }
            Err(err) => {
                let err = map_io_error(ACCEPT, err);
                tracing::warn!(code = err.code(), "accept failed: {err}");
            }
        }
    }
}

fn on_accept(stream: TcpStream, peer_addr: SocketAddr, wiring: &Wiring) -> Result<(), CoreError> {
    let local_addr = stream
        .local_addr()
        .map_err(|err| map_io_error(ACCEPT, err))?;
    let mut accept = AcceptContext::new(peer_addr, local_addr);
    if !wiring.chain.should_accept(&mut accept) {
        tracing::debug!(%peer_addr, "connection rejected by plugin");
        return Ok(());
    }
    option::apply(&stream, &accept.options)?;
    let ctx = channel::open(stream, wiring, None)?;
    tracing::debug!(connection = ctx.serial(), %peer_addr, "connection accepted");
    Ok(())
}
