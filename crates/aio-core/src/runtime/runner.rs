use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::ReentrantMutex;

use crate::queue::{BoundedQueue, OfferError, QueuePolicy};
use crate::runtime::Executor;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const CANCELLED: u8 = 2;

type Process<T> = Box<dyn Fn(T) + Send + Sync>;

/// 有序任务执行器：把一条逻辑任务队列绑定到共享执行器上，任何时刻至多一个工作者在处理它。
///
/// # 设计背景（Why）
/// - 每条连接的解码与处理都必须严格按到达顺序执行，但不能为每条连接独占一个线程；
/// - 成千上万条连接共享同一个执行器，单条连接的积压不能无限霸占线程。
///
/// # 核心机制（How）
/// - 状态机 `Idle → Scheduled → Idle`，`submit` 只在 `Idle → Scheduled` 成功时投递一个执行单元；
/// - 执行单元按 FIFO 逐条调用 `process`，每次调用都持有执行闸门（可重入互斥锁），
///   闸门既保证互斥，也让 [`join`](Self::join) 能够等待在途调用结束；
/// - 队列取空后先回到 `Idle`，再复查队列：若竞态窗口内有新条目入队，则重新抢回 `Scheduled`
///   并继续处理（双重检查重武装），保证任何已提交条目都不会被搁置；
/// - 连续处理 `max_batch` 条后，执行单元把自己重新投递给执行器并退出，状态保持 `Scheduled`。
///
/// # 契约说明（What）
/// - **互斥**：同一实例的 `process` 调用从不并发；
/// - **顺序**：条目按提交成功的顺序处理；
/// - **取消**：[`cancel`](Self::cancel) 之后 `submit` 返回 `Ok(false)` 并丢弃条目，积压条目被丢弃，
///   已出队但尚未进入闸门的条目也不会再被处理；`cancel` 本身不阻塞；
/// - `cancel` + `join` 返回后，不会再有任何 `process` 调用发生。
///
/// # 风险提示（Trade-offs）
/// - `Wait` 策略的队列满载时 `submit` 会阻塞调用线程，这是刻意保留的背压点；
/// - 在 `process` 内部对**另一个**执行器调用 `join`，若对方同时在等待本执行器，将形成互等。
pub struct OrderedRunner<T> {
    inner: Arc<RunnerInner<T>>,
}

struct RunnerInner<T> {
    queue: BoundedQueue<T>,
    state: AtomicU8,
    gate: ReentrantMutex<()>,
    executor: Arc<dyn Executor>,
    max_batch: usize,
    process: Process<T>,
}

impl<T> Clone for OrderedRunner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> OrderedRunner<T> {
    /// 构建执行器；`max_batch == 0` 按 1 处理。
    pub fn new(
        executor: Arc<dyn Executor>,
        queue_capacity: usize,
        policy: QueuePolicy,
        max_batch: usize,
        process: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                queue: BoundedQueue::new(queue_capacity, policy),
                state: AtomicU8::new(IDLE),
                gate: ReentrantMutex::new(()),
                executor,
                max_batch: max_batch.max(1),
                process: Box::new(process),
            }),
        }
    }

    /// 提交条目。
    ///
    /// - `Ok(true)`：已入队；
    /// - `Ok(false)`：执行器已取消，条目被丢弃；
    /// - `Err(OfferError::Full)`：`Reject` 策略下队列已满，条目交还调用方。
    pub fn submit(&self, item: T) -> Result<bool, OfferError<T>> {
        if self.inner.state.load(Ordering::Acquire) == CANCELLED {
            return Ok(false);
        }
        match self.inner.queue.offer(item) {
            Ok(()) => {}
            // 队列只会被 `cancel` 关闭。
            Err(OfferError::Closed(_)) => return Ok(false),
            Err(full) => return Err(full),
        }
        if self
            .inner
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            RunnerInner::dispatch(&self.inner);
        }
        Ok(true)
    }

    /// 取消执行器并丢弃积压条目。首次取消返回 `true`。
    pub fn cancel(&self) -> bool {
        let previous = self.inner.state.swap(CANCELLED, Ordering::AcqRel);
        self.inner.queue.close();
        self.inner.queue.clear();
        previous != CANCELLED
    }

    /// 等待在途的 `process` 调用结束。可在 `process` 内部对同一执行器调用。
    pub fn join(&self) {
        drop(self.inner.gate.lock());
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    /// 尚未处理的积压条目数。
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }
}

impl<T: Send + 'static> RunnerInner<T> {
    fn dispatch(this: &Arc<Self>) {
        let runner = Arc::clone(this);
        this.executor.execute(Box::new(move || runner.run()));
    }

    fn run(self: Arc<Self>) {
        let mut processed = 0usize;
        loop {
            if self.state.load(Ordering::Acquire) == CANCELLED {
                return;
            }
            if processed >= self.max_batch {
                Self::dispatch(&self);
                return;
            }
            match self.queue.poll() {
                Some(item) => {
                    let _gate = self.gate.lock();
                    if self.state.load(Ordering::Acquire) == CANCELLED {
                        return;
                    }
                    (self.process)(item);
                    processed += 1;
                }
                None => {
                    if self
                        .state
                        .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                    if self.queue.is_empty() {
                        return;
                    }
                    // 竞态窗口内有新条目：若提交方已抢先调度，交给那个执行单元处理。
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

impl<T> fmt::Debug for OrderedRunner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            IDLE => "idle",
            SCHEDULED => "scheduled",
            _ => "cancelled",
        };
        f.debug_struct("OrderedRunner")
            .field("state", &state)
            .field("queue", &self.inner.queue)
            .field("max_batch", &self.inner.max_batch)
            .finish()
    }
}
