#![deny(unsafe_code)]
#![doc = r#"
# aio-core

## 设计动机（Why）
- **定位**：异步套接字连接内核。传输层只负责把“读完成/写完成”回报进来，内核负责
  字节累积、协议识别、有序解码与处理、输出分片与背压，以及连接的生命周期收尾。
- **架构角色**：位于 `aio-buffer`（分页内存池）之上、具体传输实现（如 `aio-transport-tcp`）
  与编解码协议（如 `aio-codec`）之下，对两侧都只暴露 trait 契约。

## 核心契约（What）
- 每条连接的解码与处理分别由一个 [`OrderedRunner`] 串行化：同一连接内严格 FIFO、
  互不重叠；不同连接之间在共享 [`Executor`] 上并行；
- 输出先写入暂存租约，按 `write_chunk_size` 封装为分片进入有界刷写队列，
  任意时刻至多一个分片交给传输层；
- 连接状态 `Enabled → Closing → Closed` 单调推进，进入 `Closed` 的转换恰好回收一次资源；
- 所有失败以 [`CoreError`] 携带稳定错误码返回，不会以 panic 穿出 IO 回调。

## 实现策略（How）
- 协议注册表与插件列表在启动时构建为只读的 [`DispatchChain`]，连接以下标绑定协议；
- 执行器以 `parking_lot::ReentrantMutex` 作为执行门，允许在处理回调内部关闭连接；
- 配置以 `serde` + `toml` 装载，构建时统一校验。

## 风险与考量（Trade-offs）
- 背压通过阻塞调用线程实现，`Executor` 必须容忍阻塞任务（Tokio 适配使用 `spawn_blocking`）；
- 编码期间持有连接的输出锁，协议与插件不得在 `encode`/`before_encode` 中调用 `send` 或 `close`。
"#]

pub mod config;
pub mod connection;
pub mod error;
pub mod plugin;
pub mod protocol;
pub mod queue;
pub mod runtime;

pub use aio_buffer;
pub use config::KernelConfig;
pub use connection::{
    ConnectionBuilder, ConnectionContext, ConnectionStatus, OutboundChunk, OutboundSink,
    OutputWriter,
};
pub use error::{CoreError, ErrorCategory, Result, codes};
pub use plugin::{AcceptContext, MonitorPlugin, MonitorSnapshot, Plugin, SocketOptions};
pub use protocol::{
    DecodeOutcome, DispatchChain, DispatchChainBuilder, Packet, ProtocolHandler, ReadCursor,
    StateEvent,
};
pub use queue::{BoundedQueue, OfferError, QueuePolicy};
pub use runtime::{Executor, OrderedRunner, Task};
