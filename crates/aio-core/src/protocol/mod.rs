//! 协议契约：解码/处理/编码三段式接口、类型擦除的数据单元与协议分发链。
//!
//! # 模块定位（Why）
//! - 同一个监听端口上可能混跑多种线协议，连接在首次成功解码前并不知道自己属于哪一种；
//! - 分发链按注册顺序逐个试探，试探必须是“非破坏性”的：返回“数据不足”的协议不得推进共享读游标。
//!
//! # 核心组成（How）
//! - [`ReadCursor`]：覆盖连接未解码字节的只读游标，带 `mark/reset`；
//! - [`ProtocolHandler`]：协议实现者提供的解码、处理、编码与状态事件回调；
//! - [`DispatchChain`]：启动时一次性构建、之后只读的协议与插件注册表。

mod chain;

use std::any::Any;
use std::fmt;

use bytes::Buf;

use crate::connection::{ConnectionContext, OutputWriter};
use crate::error::CoreError;

pub use chain::{DispatchChain, DispatchChainBuilder};

/// 类型擦除的协议数据单元。
///
/// 多个协议共享一条分发链时，各自的帧类型互不相同；`Packet` 以 `Box<dyn Any + Send>` 承载，
/// 协议在 `handle`/`encode` 中按自己的具体类型向下转型。
pub struct Packet(Box<dyn Any + Send>);

impl Packet {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// 取回具体类型；类型不符时原样返回。
    pub fn downcast<T: Any>(self) -> Result<T, Packet> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(original) => Err(Packet(original)),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Packet(..)")
    }
}

/// 一次解码尝试的结果。
#[derive(Debug)]
pub enum DecodeOutcome {
    /// 完整解析出一个数据单元，游标已越过该帧。
    Complete(Packet),
    /// 数据不足（或不属于本协议），游标位置会被分发链恢复。
    Incomplete,
}

/// 覆盖连接未解码字节的读游标。
///
/// 游标只向前移动；`mark` 记录当前位置，`reset` 回到最近一次 `mark`。分发链在每次试探前后
/// 自行保存/恢复位置，解码器无需为“数据不足”路径手动回退，但可以在帧内部使用 `mark/reset`
/// 做多段试探。
#[derive(Debug)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    mark: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            mark: 0,
        }
    }

    /// 已消费的字节数。
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// 游标之后的全部字节。
    pub fn chunk(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    pub fn reset(&mut self) {
        self.pos = self.mark;
    }

    /// 查看接下来 `len` 字节但不移动游标。
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        self.chunk().get(..len)
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        let byte = *self.chunk().first()?;
        self.pos += 1;
        Some(byte)
    }

    /// 读取大端 `u32`。
    pub fn get_u32(&mut self) -> Option<u32> {
        let mut chunk = self.chunk();
        if chunk.remaining() < 4 {
            return None;
        }
        let value = chunk.get_u32();
        self.pos += 4;
        Some(value)
    }

    /// 取出接下来 `len` 字节。
    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.peek(len)?;
        self.pos += len;
        Some(bytes)
    }

    /// 跳过 `len` 字节；不足时不移动并返回 `false`。
    pub fn advance(&mut self, len: usize) -> bool {
        if len > self.remaining() {
            return false;
        }
        self.pos += len;
        true
    }

    pub(crate) fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }
}

/// 连接生命周期与异常事件，按注册顺序广播给所有插件，再交给绑定协议（未绑定时交给首个协议）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    /// 连接上下文创建完成。
    NewConnection,
    /// 对端关闭了写方向（读到 EOF）。
    InputShutdown,
    /// 读失败或解码失败，连接随后关闭。
    InputException,
    /// 写失败，连接随后立即关闭。
    OutputException,
    /// 业务处理失败，连接保持。
    ProcessException,
    /// 开始关闭。
    Closing,
    /// 关闭完成，所有资源已归还。
    Closed,
}

impl StateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateEvent::NewConnection => "new_connection",
            StateEvent::InputShutdown => "input_shutdown",
            StateEvent::InputException => "input_exception",
            StateEvent::OutputException => "output_exception",
            StateEvent::ProcessException => "process_exception",
            StateEvent::Closing => "closing",
            StateEvent::Closed => "closed",
        }
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议实现契约。
///
/// # 契约说明（What）
/// - `name`：分发链内唯一的协议名，连接绑定后以它标识协议；
/// - `decode`：从游标解析一个数据单元。数据不足返回 [`DecodeOutcome::Incomplete`]；
///   字节流非法返回错误，连接会收到 `InputException` 并关闭。跨多次读完成的帧可以借助
///   连接的属性表保存续解状态；
/// - `handle`：在连接的处理执行器上按解码顺序调用；返回 `Some(reply)` 时内核代为 `send`；
///   返回错误时连接收到 `ProcessException` 但保持打开；
/// - `encode`：把数据单元序列化进输出写入器；执行期间持有连接的输出锁，不得在其中调用 `send`；
/// - `on_state_event`：可选的状态事件回调。
pub trait ProtocolHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn decode(
        &self,
        cursor: &mut ReadCursor<'_>,
        ctx: &ConnectionContext,
    ) -> Result<DecodeOutcome, CoreError>;

    fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<Option<Packet>, CoreError>;

    fn encode(
        &self,
        packet: &Packet,
        out: &mut OutputWriter<'_>,
        ctx: &ConnectionContext,
    ) -> Result<(), CoreError>;

    fn on_state_event(
        &self,
        _ctx: &ConnectionContext,
        _event: StateEvent,
        _error: Option<&CoreError>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_mark_and_reset() {
        let data = [0, 0, 0, 3, b'a', b'b', b'c', b'd'];
        let mut cursor = ReadCursor::new(&data);
        cursor.mark();
        assert_eq!(cursor.get_u32(), Some(3));
        assert_eq!(cursor.take(3), Some(&b"abc"[..]));
        assert_eq!(cursor.take(2), None, "不足时不得移动");
        assert_eq!(cursor.position(), 7);
        cursor.reset();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.peek(4), Some(&data[..4]));
        assert!(!cursor.advance(9));
        assert!(cursor.advance(8));
        assert_eq!(cursor.get_u8(), None);
    }

    #[test]
    fn packet_downcast_roundtrip() {
        let packet = Packet::new(String::from("hello"));
        assert!(packet.is::<String>());
        assert_eq!(packet.downcast_ref::<String>().map(String::as_str), Some("hello"));
        let packet = packet.downcast::<u32>().expect_err("类型不符应原样返回");
        assert_eq!(packet.downcast::<String>().expect("类型相符"), "hello");
    }
}
