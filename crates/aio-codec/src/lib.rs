#![deny(unsafe_code)]

//! `aio-codec` 提供两种开箱即用的文本协议，演示如何在 `aio-core` 的分发链上实现
//! [`ProtocolHandler`](aio_core::ProtocolHandler)。
//!
//! # 教案背景（Why）
//! - 内核只认识类型擦除的 [`Packet`](aio_core::Packet)，协议作者需要一个完整的参照来理解
//!   “数据不足”“非法字节流”“业务回复”三条路径分别如何表达；
//! - 两种协议可以注册在同一条分发链上，由首个完整解码的协议绑定连接。
//!
//! # 使用概览（How）
//! - [`StringProtocol`]：4 字节大端长度 + UTF-8 负载；
//! - [`LineProtocol`]：换行结尾的 UTF-8 文本，兼容 `\r\n`；
//! - 二者的业务回调都是 `Fn(&ConnectionContext, String) -> Result<Option<String>, CoreError>`，
//!   返回 `Some` 时内核代为编码并发送回复。

mod line;
mod string;

use aio_core::{ConnectionContext, CoreError};

pub use line::LineProtocol;
pub use string::StringProtocol;

/// 文本协议的业务回调。
pub type TextHandler =
    dyn Fn(&ConnectionContext, String) -> Result<Option<String>, CoreError> + Send + Sync;
