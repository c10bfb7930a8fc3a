use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::error::BufferError;
use crate::page::Page;
use crate::pool::PoolMetrics;

/// 虚拟缓冲租约：对某个内存页子区间的独占句柄，带读写双游标。
///
/// # 设计初衷（Why）
/// - 连接的读缓冲、输出分片都需要“借一段池内存、用完归还”，同时保留 Java `ByteBuffer`
///   式的读写游标，便于解码器增量消费；
/// - 归还只能发生一次：句柄被 `release(self)` 或 `Drop` 消耗后，类型系统保证无法再读写。
///
/// # 核心机制（How）
/// - `buf` 的长度始终等于租约容量，写游标 `write_pos` 标记已写入的边界，读游标 `read_pos`
///   标记已消费的边界，满足 `read_pos <= write_pos <= capacity`；
/// - 所有写入都先检查剩余容量，超出时返回 [`BufferError::Overflow`]，从不触发
///   `BytesMut` 自身的扩容（扩容会让租约脱离所属页）。
///
/// # 契约说明（What）
/// - **前置条件**：租约由 [`BufferPagePool::allocate`](crate::BufferPagePool::allocate) 创建，分配时内容已清零；
/// - **后置条件**：释放后区间回到所属页的空闲表，池的 `used_bytes` 同步扣减。
pub struct Lease {
    page: Arc<Page>,
    metrics: Arc<PoolMetrics>,
    offset: usize,
    buf: Option<BytesMut>,
    read_pos: usize,
    write_pos: usize,
}

impl Lease {
    pub(crate) fn new(
        page: Arc<Page>,
        metrics: Arc<PoolMetrics>,
        offset: usize,
        mut buf: BytesMut,
    ) -> Self {
        buf.fill(0);
        Self {
            page,
            metrics,
            offset,
            buf: Some(buf),
            read_pos: 0,
            write_pos: 0,
        }
    }

    fn bytes(&self) -> &BytesMut {
        // `buf` 只在 `Drop` 中被取走，之后句柄不可再访问。
        self.buf.as_ref().unwrap_or_else(|| unreachable!("lease used after release"))
    }

    fn bytes_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("lease used after release"))
    }

    /// 所属页序号。
    pub fn page_index(&self) -> usize {
        self.page.index()
    }

    /// 区间在页内的起始偏移。
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 租约容量。
    pub fn capacity(&self) -> usize {
        self.bytes().len()
    }

    /// 已写入的字节数（写游标）。
    pub fn len(&self) -> usize {
        self.write_pos
    }

    /// 是否尚未写入任何字节。
    pub fn is_empty(&self) -> bool {
        self.write_pos == 0
    }

    /// 读游标位置。
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// 剩余可写容量。
    pub fn remaining_mut(&self) -> usize {
        self.capacity() - self.write_pos
    }

    /// 尚未被消费的字节数。
    pub fn remaining(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// 追加字节切片。
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let remaining = self.remaining_mut();
        if src.len() > remaining {
            return Err(BufferError::Overflow {
                needed: src.len(),
                remaining,
            });
        }
        let start = self.write_pos;
        self.bytes_mut()[start..start + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
        Ok(())
    }

    /// 追加单字节。
    pub fn put_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.put_slice(&[value])
    }

    /// 以大端序追加 `u32`。
    pub fn put_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.put_slice(&value.to_be_bytes())
    }

    /// 写游标之后的可写区域，供套接字直接读入。配合 [`Self::advance_write`] 使用。
    pub fn writable_mut(&mut self) -> &mut [u8] {
        let start = self.write_pos;
        &mut self.bytes_mut()[start..]
    }

    /// 确认外部已向 [`Self::writable_mut`] 写入 `len` 字节。
    pub fn advance_write(&mut self, len: usize) -> Result<(), BufferError> {
        let remaining = self.remaining_mut();
        if len > remaining {
            return Err(BufferError::Overflow {
                needed: len,
                remaining,
            });
        }
        self.write_pos += len;
        Ok(())
    }

    /// 未消费的字节视图。
    pub fn readable(&self) -> &[u8] {
        &self.bytes()[self.read_pos..self.write_pos]
    }

    /// 已写入的全部字节（忽略读游标）。
    pub fn written(&self) -> &[u8] {
        &self.bytes()[..self.write_pos]
    }

    /// 推进读游标。
    pub fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(BufferError::Underflow {
                needed: len,
                remaining,
            });
        }
        self.read_pos += len;
        Ok(())
    }

    /// 读出一个大端 `u32` 并推进读游标。
    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        let mut readable = self.readable();
        if readable.len() < 4 {
            return Err(BufferError::Underflow {
                needed: 4,
                remaining: readable.len(),
            });
        }
        let value = readable.get_u32();
        self.read_pos += 4;
        Ok(value)
    }

    /// 把未消费字节搬到区间头部，腾出尾部写空间。
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let (read, write) = (self.read_pos, self.write_pos);
        self.bytes_mut().copy_within(read..write, 0);
        self.write_pos = write - read;
        self.read_pos = 0;
    }

    /// 把写游标回退到 `len`，丢弃其后已写入的字节；不会回退到读游标之前。
    pub fn truncate(&mut self, len: usize) {
        if len < self.write_pos {
            self.write_pos = len.max(self.read_pos);
        }
    }

    /// 重置双游标，不改变容量。
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// 显式归还租约；等价于 `drop(lease)`。
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let len = buf.len();
            self.page.reclaim(self.offset, buf);
            self.metrics.on_release(len);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("page", &self.page_index())
            .field("offset", &self.offset)
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}
