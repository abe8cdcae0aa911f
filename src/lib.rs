//! 有栈协程运行时
//!
//! 实现 M:N 协作式调度：大量协程复用少量工作线程，
//! 协程只在显式挂起点让出，不会被强行打断。
//!
//! 核心组件：
//! - Coroutine: 协程，携带自己的栈和可恢复上下文
//! - Processor: 逻辑处理器，管理本地运行队列
//! - Worker: 操作系统线程，执行协程
//! - DispatchQueue: 调用者提供的派发队列（串行/并发）
//!
//! ```no_run
//! use std::time::Duration;
//!
//! // 默认队列，即发即忘
//! coro::launch(|| {
//!     coro::sleep(Duration::from_millis(10))?;
//!     Ok(())
//! }).unwrap();
//!
//! // 指定队列
//! let queue = coro::DispatchQueue::serial("my-queue");
//! coro::launch_on(&queue, || Ok(())).unwrap();
//!
//! // 指定栈大小
//! let handle = coro::launch_with(
//!     coro::LaunchOptions { queue: None, stack_size: Some(128 * 1024) },
//!     || Ok(()),
//! ).unwrap();
//! handle.join().unwrap();
//! ```

mod arch;
mod context;
mod timer;
mod worker;

pub mod coroutine;
pub mod handle;
pub mod launch;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod stack;

pub use coroutine::{CoError, CoStatus, StateError};
pub use handle::JoinHandle;
pub use launch::{
    current_id, hop_to, is_cancelled, launch, launch_on, launch_with, sleep, yield_now,
    LaunchError, LaunchOptions,
};
pub use queue::{DispatchQueue, QueueKind};
pub use scheduler::{configure, get_scheduler, Scheduler, SchedulerConfig, SchedulerStats};
pub use stack::Stack;

/// 协程 ID 类型
pub type CoId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
