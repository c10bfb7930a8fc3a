use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::BufferError;
use crate::lease::Lease;
use crate::page::Page;

/// 内存池配置，对应原系统 `MemoryPool(pageSize, pageNum)` 的旋钮。
///
/// - `page_size`：单页字节数，同时也是单次租借的上限；
/// - `initial_pages`：构建时预分配的页数；
/// - `max_pages`：按需扩页的上限，达到后租借失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub page_size: usize,
    pub initial_pages: usize,
    pub max_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: 1024 * 1024,
            initial_pages: 1,
            max_pages: 16,
        }
    }
}

impl PoolConfig {
    /// 校验配置自洽性。
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.page_size == 0 {
            return Err(BufferError::InvalidConfig("page_size must be positive"));
        }
        if self.max_pages == 0 {
            return Err(BufferError::InvalidConfig("max_pages must be positive"));
        }
        if self.initial_pages > self.max_pages {
            return Err(BufferError::InvalidConfig(
                "initial_pages must not exceed max_pages",
            ));
        }
        Ok(())
    }
}

/// 池统计快照。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub page_size: usize,
    pub pages: usize,
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub active_leases: usize,
    pub total_allocations: usize,
    pub failed_allocations: usize,
    pub largest_free_span: usize,
}

/// `BufferPagePool` 是所有连接共享的分页内存池。
///
/// # 模块角色（Why）
/// - 为读缓冲、输出暂存区与刷写分片提供统一来源，压制高并发下的堆分配抖动；
/// - 借助租约的 `Drop` 钩子自动归还，调用方无需关心回收细节。
///
/// # 核心机制（How）
/// - 页列表以 `ArcSwap<Vec<Arc<Page>>>` 发布，租借路径只做一次无锁快照读取；
/// - 从轮转游标开始逐页首次适配，分散不同连接对同一页锁的竞争；
/// - 所有页都放不下时，持有 `grow` 锁双重检查后追加新页，直至 `max_pages`；
/// - `PoolMetrics` 以原子计数维护已用字节、活跃租约等统计。
///
/// # 契约说明（What）
/// - **线程安全**：`Clone` 后可在任意线程并发租借/归还；单页元数据修改是唯一的互斥单元；
/// - **后置条件**：成功返回的租约容量 `>= size`，内容已清零；
/// - **失败语义**：超出页容量返回 [`BufferError::RequestTooLarge`]，页数耗尽返回
///   [`BufferError::Exhausted`]，两者都会计入 `failed_allocations`。
///
/// # 设计权衡（Trade-offs）
/// - 页只增不减；峰值过后内存仍驻留，换取稳定的租借延迟；
/// - 首次适配在碎片严重时需要遍历空闲表，页容量越大遍历越长。
#[derive(Clone)]
pub struct BufferPagePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    pages: ArcSwap<Vec<Arc<Page>>>,
    grow: Mutex<()>,
    cursor: AtomicUsize,
    metrics: Arc<PoolMetrics>,
}

impl BufferPagePool {
    /// 按配置构建内存池并预分配 `initial_pages` 页。
    pub fn new(config: PoolConfig) -> Result<Self, BufferError> {
        config.validate()?;
        let pages: Vec<Arc<Page>> = (0..config.initial_pages)
            .map(|index| Arc::new(Page::new(index, config.page_size)))
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                pages: ArcSwap::from_pointee(pages),
                grow: Mutex::new(()),
                cursor: AtomicUsize::new(0),
                metrics: Arc::new(PoolMetrics::default()),
            }),
        })
    }

    /// 返回构建时的配置。
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 租借至少 `size` 字节；`size == 0` 按 1 字节处理。
    pub fn allocate(&self, size: usize) -> Result<Lease, BufferError> {
        let size = size.max(1);
        let page_size = self.inner.config.page_size;
        if size > page_size {
            self.inner.metrics.on_failure();
            return Err(BufferError::RequestTooLarge {
                requested: size,
                page_size,
            });
        }

        let snapshot = self.inner.pages.load();
        if let Some(lease) = self.carve_from(&snapshot, size) {
            return Ok(lease);
        }
        drop(snapshot);
        self.grow_and_carve(size)
    }

    /// 归还租约，等价于丢弃它。
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    fn carve_from(&self, pages: &[Arc<Page>], size: usize) -> Option<Lease> {
        if pages.is_empty() {
            return None;
        }
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % pages.len();
        for step in 0..pages.len() {
            let page = &pages[(start + step) % pages.len()];
            if let Some((offset, span)) = page.try_carve(size) {
                return Some(self.lease_from(page, offset, span));
            }
        }
        None
    }

    fn grow_and_carve(&self, size: usize) -> Result<Lease, BufferError> {
        let _guard = self.inner.grow.lock();
        let current = self.inner.pages.load_full();
        // 等锁期间可能已有其它线程扩页或归还。
        if let Some(lease) = self.carve_from(&current, size) {
            return Ok(lease);
        }

        let max_pages = self.inner.config.max_pages;
        if current.len() >= max_pages {
            self.inner.metrics.on_failure();
            return Err(BufferError::Exhausted {
                requested: size,
                pages: current.len(),
                max_pages,
            });
        }

        let page = Arc::new(Page::new(current.len(), self.inner.config.page_size));
        let carved = page.try_carve(size);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&page));
        self.inner.pages.store(Arc::new(next));

        match carved {
            Some((offset, span)) => Ok(self.lease_from(&page, offset, span)),
            None => {
                self.inner.metrics.on_failure();
                Err(BufferError::Exhausted {
                    requested: size,
                    pages: current.len() + 1,
                    max_pages,
                })
            }
        }
    }

    fn lease_from(&self, page: &Arc<Page>, offset: usize, span: bytes::BytesMut) -> Lease {
        self.inner.metrics.on_allocate(span.len());
        Lease::new(
            Arc::clone(page),
            Arc::clone(&self.inner.metrics),
            offset,
            span,
        )
    }

    /// 已租出的字节总数。
    pub fn used_bytes(&self) -> usize {
        self.inner.metrics.used_bytes.load(Ordering::Acquire)
    }

    /// 活跃租约数量。
    pub fn active_leases(&self) -> usize {
        self.inner.metrics.active_leases.load(Ordering::Acquire)
    }

    /// 当前页数。
    pub fn page_count(&self) -> usize {
        self.inner.pages.load().len()
    }

    /// 生成统计快照。各字段分别读取，并发租借时快照之间可能存在瞬时偏差。
    pub fn stats(&self) -> PoolStats {
        let pages = self.inner.pages.load();
        let page_size = self.inner.config.page_size;
        let capacity_bytes = pages.len() * page_size;
        let used_bytes = self.used_bytes();
        PoolStats {
            page_size,
            pages: pages.len(),
            capacity_bytes,
            used_bytes,
            free_bytes: capacity_bytes.saturating_sub(used_bytes),
            active_leases: self.active_leases(),
            total_allocations: self.inner.metrics.total_allocations.load(Ordering::Relaxed),
            failed_allocations: self.inner.metrics.failed_allocations.load(Ordering::Relaxed),
            largest_free_span: pages
                .iter()
                .map(|page| page.largest_free_span())
                .max()
                .unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for BufferPagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPagePool")
            .field("config", &self.inner.config)
            .field("pages", &self.page_count())
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct PoolMetrics {
    used_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    total_allocations: AtomicUsize,
    failed_allocations: AtomicUsize,
}

impl PoolMetrics {
    fn on_allocate(&self, len: usize) {
        self.used_bytes.fetch_add(len, Ordering::AcqRel);
        self.active_leases.fetch_add(1, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_release(&self, len: usize) {
        self.used_bytes.fetch_sub(len, Ordering::AcqRel);
        self.active_leases.fetch_sub(1, Ordering::AcqRel);
    }

    fn on_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inconsistent_config() {
        let err = BufferPagePool::new(PoolConfig {
            page_size: 128,
            initial_pages: 3,
            max_pages: 2,
        })
        .expect_err("initial_pages 超过上限必须失败");
        assert!(matches!(err, BufferError::InvalidConfig(_)));
    }

    #[test]
    fn grows_on_demand_then_reports_exhaustion() {
        let pool = BufferPagePool::new(PoolConfig {
            page_size: 32,
            initial_pages: 0,
            max_pages: 2,
        })
        .expect("构建内存池失败");
        assert_eq!(pool.page_count(), 0);

        let a = pool.allocate(32).expect("首页租借失败");
        let b = pool.allocate(32).expect("扩页租借失败");
        assert_eq!(pool.page_count(), 2);
        assert_ne!(a.page_index(), b.page_index());

        let err = pool.allocate(1).expect_err("页数耗尽后必须失败");
        assert!(matches!(err, BufferError::Exhausted { max_pages: 2, .. }));
        assert_eq!(pool.stats().failed_allocations, 1);

        drop(a);
        let c = pool.allocate(16).expect("归还后应可再次租借");
        assert_eq!(c.capacity(), 16);
        assert_eq!(pool.page_count(), 2, "归还后的空间应被复用而不是扩页");
    }

    #[test]
    fn oversized_request_is_rejected_not_truncated() {
        let pool = BufferPagePool::new(PoolConfig {
            page_size: 16,
            initial_pages: 1,
            max_pages: 4,
        })
        .expect("构建内存池失败");
        let err = pool.allocate(17).expect_err("超页请求必须失败");
        assert_eq!(
            err,
            BufferError::RequestTooLarge {
                requested: 17,
                page_size: 16
            }
        );
        assert_eq!(pool.page_count(), 1);
    }
}
