//! 单个内存页及其空闲区间表。

use std::collections::BTreeMap;

use bytes::BytesMut;
use spin::Mutex;

/// 内存页：一块 `page_size` 字节的连续内存，被切分为互不重叠的空闲/已用区间。
///
/// # 核心机制（How）
/// - 页初始化时分配一个长度等于容量的 `BytesMut`，作为唯一的空闲区间挂在偏移 0；
/// - 租借时对首个足够大的空闲区间执行 `split_off`，前半段交给租约，后半段留在表中；
/// - 归还时按偏移插回，并与紧邻的前驱/后继区间通过 `BytesMut::unsplit` 合并，
///   由于所有区间都来自同一次分配且长度始终等于容量，合并是 O(1) 的指针拼接。
///
/// # 契约说明（What）
/// - 空闲表中的区间两两不相交，且与所有活跃租约不相交；
/// - `used + 空闲区间总长 == capacity` 恒成立；
/// - 元数据修改只在本页的 `spin::Mutex` 内进行，不同页互不阻塞。
pub struct Page {
    index: usize,
    capacity: usize,
    state: Mutex<PageState>,
}

struct PageState {
    free: BTreeMap<usize, BytesMut>,
    used: usize,
}

impl Page {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        let mut storage = BytesMut::with_capacity(capacity);
        storage.resize(capacity, 0);
        let mut free = BTreeMap::new();
        free.insert(0, storage);
        Self {
            index,
            capacity,
            state: Mutex::new(PageState { free, used: 0 }),
        }
    }

    /// 页在池中的序号。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 页容量（字节）。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前已租出的字节数。
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// 最大连续空闲区间，用于观测碎片程度。
    pub fn largest_free_span(&self) -> usize {
        let state = self.state.lock();
        state.free.values().map(BytesMut::len).max().unwrap_or(0)
    }

    /// 空闲区间数量；完全空闲的页应当恰好只有一个区间。
    pub fn free_spans(&self) -> usize {
        self.state.lock().free.len()
    }

    /// 首次适配地切出 `size` 字节，返回区间偏移与独占的 `BytesMut`。
    pub(crate) fn try_carve(&self, size: usize) -> Option<(usize, BytesMut)> {
        let mut state = self.state.lock();
        let offset = state
            .free
            .iter()
            .find(|(_, span)| span.len() >= size)
            .map(|(offset, _)| *offset)?;
        let mut span = state.free.remove(&offset)?;
        if span.len() > size {
            let rest = span.split_off(size);
            state.free.insert(offset + size, rest);
        }
        state.used += span.len();
        Some((offset, span))
    }

    /// 归还区间并与相邻空闲区间合并。
    ///
    /// 重叠即说明同一区间被归还了两次或租约互相别名，此时继续运行会破坏其它连接的数据，直接 panic。
    pub(crate) fn reclaim(&self, offset: usize, mut span: BytesMut) {
        let len = span.len();
        let end = offset + len;
        assert!(
            end <= self.capacity,
            "span {offset}..{end} escapes page {} of {} bytes",
            self.index,
            self.capacity
        );

        let mut state = self.state.lock();

        let predecessor = state
            .free
            .range(..=offset)
            .next_back()
            .map(|(start, span)| (*start, span.len()));
        if let Some((start, pred_len)) = predecessor {
            assert!(
                start + pred_len <= offset,
                "double release: span {offset}..{end} overlaps free span {start}..{} on page {}",
                start + pred_len,
                self.index
            );
        }

        let successor = state.free.range(offset..).next().map(|(start, _)| *start);
        if let Some(start) = successor {
            assert!(
                start >= end,
                "double release: span {offset}..{end} overlaps free span starting at {start} on page {}",
                self.index
            );
        }

        state.used -= len;

        if successor == Some(end)
            && let Some(next) = state.free.remove(&end)
        {
            span.unsplit(next);
        }

        match predecessor {
            Some((start, pred_len)) if start + pred_len == offset => {
                if let Some(mut prev) = state.free.remove(&start) {
                    prev.unsplit(span);
                    state.free.insert(start, prev);
                }
            }
            _ => {
                state.free.insert(offset, span);
            }
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .field("used", &state.used)
            .field("free_spans", &state.free.len())
            .finish()
    }
}
