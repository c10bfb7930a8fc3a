use std::net::SocketAddr;
use std::sync::Arc;

use aio_core::aio_buffer::BufferPagePool;
use aio_core::{ConnectionContext, CoreError, DispatchChain, Executor, KernelConfig, SocketOptions};
use tokio::net::TcpStream;

use crate::channel::{self, Wiring};
use crate::error::{CONNECT, map_io_error};
use crate::option;

/// TCP 客户端引导。
///
/// 客户端通常在发出第一条请求之前就要编码，因此可以用 [`protocol`](Self::protocol)
/// 预先绑定协议，不必等待首次解码。
pub struct ClientBootstrap {
    addr: SocketAddr,
    chain: Arc<DispatchChain>,
    config: KernelConfig,
    pool: Option<BufferPagePool>,
    protocol: Option<String>,
    options: SocketOptions,
}

impl ClientBootstrap {
    pub fn new(addr: SocketAddr, chain: Arc<DispatchChain>) -> Self {
        Self {
            addr,
            chain,
            config: KernelConfig::default(),
            pool: None,
            protocol: None,
            options: SocketOptions {
                nodelay: Some(true),
                ..SocketOptions::default()
            },
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool(mut self, pool: BufferPagePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocol = Some(name.into());
        self
    }

    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn connect(self) -> Result<ConnectionContext, CoreError> {
        self.config.validate()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => BufferPagePool::new(self.config.pool)?,
        };
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|err| map_io_error(CONNECT, err))?;
        option::apply(&stream, &self.options)?;
        let executor: Arc<dyn Executor> = Arc::new(tokio::runtime::Handle::current());
        let wiring = Wiring {
            chain: self.chain,
            pool,
            config: Arc::new(self.config),
            executor,
        };
        let ctx = channel::open(stream, &wiring, self.protocol.as_deref())?;
        tracing::debug!(connection = ctx.serial(), addr = %self.addr, "connected");
        Ok(ctx)
    }
}
