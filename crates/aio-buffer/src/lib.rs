#![deny(unsafe_code)]

//! `aio-buffer` 为连接内核提供分页内存池与“虚拟缓冲”租约。
//!
//! # 模块定位（Why）
//! - 连接的读缓冲、输出暂存区与待刷写分片都来自同一个池，避免每次 IO 完成都向系统申请内存；
//! - 内存页被多个连接共享，因此池必须保证租约之间互不重叠，并且归还后的字节不会泄露给下一位租户。
//!
//! # 设计概要（How）
//! - [`page`] 模块维护单页的空闲区间表（按偏移排序），每页一把 `spin::Mutex`，
//!   不同页之间的租借/归还可以并行；
//! - [`Lease`] 持有通过 `BytesMut::split_off` 切出的独占区间，释放时按偏移合并回相邻空闲区间；
//! - [`BufferPagePool`] 以 `ArcSwap` 发布页列表，读路径无锁，只有扩页时串行。
//!
//! # 契约（What）
//! - `allocate` 永不阻塞；超过 `max_pages` 后返回 [`BufferError::Exhausted`]，绝不截断请求；
//! - 租约只能释放一次：`Lease::release(self)` 或 `Drop` 消耗句柄，释放后无法再访问；
//! - 页内重复归还同一区间属于内核不变量破坏，直接 panic。

mod error;
mod lease;
pub mod page;
mod pool;

pub use error::BufferError;
pub use lease::Lease;
pub use pool::{BufferPagePool, PoolConfig, PoolStats};
