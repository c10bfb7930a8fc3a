//! 定长 FIFO 队列，支持“满则等待”与“满则拒绝”两种策略。

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

/// 队列满时的生产者策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// 阻塞调用线程，直到有空位或队列被关闭。
    Wait,
    /// 立即返回 [`OfferError::Full`]。
    Reject,
}

/// 入队失败，被拒绝的条目原样交还调用方。
pub enum OfferError<T> {
    /// `Reject` 策略下队列已满。
    Full(T),
    /// 队列已关闭。
    Closed(T),
}

impl<T> OfferError<T> {
    /// 取回被拒绝的条目。
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Full(item) | OfferError::Closed(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, OfferError::Closed(_))
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferError::Full(_) => f.write_str("Full(..)"),
            OfferError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferError::Full(_) => f.write_str("queue is full"),
            OfferError::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> std::error::Error for OfferError<T> {}

type NotifyHook = Box<dyn Fn() + Send + Sync>;

/// 有界队列：容量 `C >= 1`，FIFO，两种满载策略，可选的“非空通知”钩子。
///
/// # 设计初衷（Why）
/// - 解码、处理、刷写三条流水线都需要一个能施加背压的缓冲点，原始读数据来得比消费快时
///   应当让生产者停下来，而不是无限堆积；
/// - 连接关闭时必须能一次性丢弃积压条目并唤醒所有阻塞的生产者，避免线程永远挂起。
///
/// # 核心机制（How）
/// - `parking_lot::Mutex<VecDeque<T>>` 保存条目与关闭标记，`Condvar` 只用于唤醒等待空位的生产者；
/// - `poll` 从不阻塞，成功出队后唤醒一个生产者；`clear`/`close` 唤醒全部生产者；
/// - 通知钩子只在一次 `offer` 使队列由空变为非空时触发，且在释放队列锁之后调用，
///   钩子内部可以安全地再次访问本队列。
///
/// # 契约说明（What）
/// - 任意时刻 `len() <= capacity()`；
/// - `poll` 的出队顺序与 `offer` 的成功顺序一致；
/// - 关闭后所有 `offer` 返回 [`OfferError::Closed`]，已入队条目仍可被 `poll` 取走，直到 `clear`。
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    capacity: usize,
    policy: QueuePolicy,
    notify: Option<NotifyHook>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    /// 创建队列。
    ///
    /// # Panics
    /// `capacity == 0` 属于编程错误。
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be at least 1");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            capacity,
            policy,
            notify: None,
        }
    }

    /// 安装单消费者通知钩子。
    pub fn with_notify(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.notify = Some(Box::new(hook));
        self
    }

    /// 入队；按策略在满载时等待或拒绝。
    pub fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(OfferError::Closed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            match self.policy {
                QueuePolicy::Reject => return Err(OfferError::Full(item)),
                QueuePolicy::Wait => self.not_full.wait(&mut state),
            }
        }
        let was_empty = state.items.is_empty();
        state.items.push_back(item);
        drop(state);

        if was_empty && let Some(hook) = &self.notify {
            hook();
        }
        Ok(())
    }

    /// 非阻塞出队；`None` 表示队列为空。
    pub fn poll(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// 丢弃全部积压条目，返回丢弃数量。条目在锁外析构。
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        drained.len()
    }

    /// 关闭队列并唤醒所有阻塞的生产者。
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reject_policy_hands_item_back() {
        let queue = BoundedQueue::new(2, QueuePolicy::Reject);
        queue.offer(1).expect("首个条目应入队");
        queue.offer(2).expect("第二个条目应入队");
        let err = queue.offer(3).expect_err("满载必须拒绝");
        assert!(matches!(err, OfferError::Full(3)));
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn close_wakes_blocked_producer_with_failure() {
        let queue = Arc::new(BoundedQueue::new(1, QueuePolicy::Wait));
        queue.offer(0u32).expect("预填充失败");

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.offer(1))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();

        let result = producer.join().expect("生产者线程 panic");
        assert!(matches!(result, Err(OfferError::Closed(1))));
        assert_eq!(queue.poll(), Some(0), "关闭前的条目仍可取出");
    }

    #[test]
    fn notify_fires_only_on_empty_to_non_empty() {
        let fired = Arc::new(AtomicUsize::new(0));
        let queue = {
            let fired = Arc::clone(&fired);
            BoundedQueue::new(4, QueuePolicy::Reject).with_notify(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        queue.offer('a').expect("入队失败");
        queue.offer('b').expect("入队失败");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.clear(), 2);
        queue.offer('c').expect("入队失败");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn zero_capacity_is_a_programming_error() {
        let _ = BoundedQueue::<u8>::new(0, QueuePolicy::Reject);
    }
}
