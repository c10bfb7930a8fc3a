use std::sync::Arc;

/// 交给执行器运行的工作单元。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 共享线程池的最小契约。
///
/// # 契约说明（What）
/// - `execute` 不得在调用线程上同步运行 `task`：[`OrderedRunner`](crate::runtime::OrderedRunner)
///   在提交执行单元时可能仍持有调用方的上下文；
/// - 执行器可以并发运行任意多个任务，有序性由执行器之上的状态机保证。
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

/// Tokio 适配：执行单元投递到运行时的阻塞线程池。
///
/// 解码/处理回调是同步代码，且 `send` 可能在刷写队列满载时等待空位；放在阻塞线程池里
/// 不会占住负责读写套接字的异步工作线程，等待中的回调也就不会饿死唤醒它的写完成任务。
/// 线程数上限由 `Builder::max_blocking_threads` 控制。
#[cfg(feature = "runtime-tokio")]
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) {
        // JoinHandle 直接丢弃：执行单元自行处理结果与取消。
        drop(self.spawn_blocking(task));
    }
}
