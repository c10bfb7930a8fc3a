#![deny(unsafe_code)]
#![doc = r#"
# aio-transport-tcp

## 设计动机（Why）
- **定位**：把 Tokio 的 TCP 套接字接入 `aio-core` 连接内核：读任务把字节装进池租约回报
  “读完成”，写任务把内核交出的分片写出后回报“写完成”。
- **架构角色**：传输实现层；内核只看到 [`OutboundSink`](aio_core::OutboundSink) 与
  读写完成入口，不依赖任何 Tokio 类型。

## 核心契约（What）
- [`ServerBootstrap`]：绑定、接入过滤、套接字选项、连接装配；
- [`ClientBootstrap`]：建连并可预先绑定协议；
- [`SocketOptionPlugin`]：以插件形式为入站连接写入套接字选项，默认开启 `TCP_NODELAY`；
- IO 失败映射为带 `aio.transport.tcp.*` 稳定错误码的 [`CoreError`](aio_core::CoreError)。

## 实现策略（How）
- 套接字拆分为读/写两个半部，各由一个任务驱动；
- 内核回调可能因背压阻塞，任务在多线程运行时上以 `block_in_place` 调用它们；
- 连接关闭时写出端丢弃发送通道并广播停止信号，两个任务随之退出。

## 风险与考量（Trade-offs）
- 需要 Tokio 多线程运行时；单线程运行时下背压阻塞会卡住整个运行时；
- `ServerHandle::shutdown` 只停止接入，已建立的连接由各自的生命周期收尾。
"#]

mod channel;
mod client;
mod error;
mod option;
mod server;

pub use client::ClientBootstrap;
pub use option::SocketOptionPlugin;
pub use server::{ServerBootstrap, ServerHandle};
