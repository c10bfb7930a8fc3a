//! 共享执行器抽象与“每连接单活跃工作者”的有序任务执行器。
//!
//! - [`Executor`] 只要求“把一个闭包交给某个线程跑完”，内核不关心线程池的实现；
//! - [`OrderedRunner`] 在共享执行器之上为每条流水线提供严格 FIFO、互不重叠的执行语义。

mod executor;
mod runner;

pub use executor::{Executor, Task};
pub use runner::OrderedRunner;
