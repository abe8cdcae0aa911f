//! 逻辑处理器
//!
//! 每个处理器持有一个本地运行队列，绑定到一个工作线程执行。

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::coroutine::Coroutine;
use crate::queue::LocalQueue;

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲
    Idle = 0,
    /// 运行中
    Running = 1,
    /// 停止
    Stopped = 2,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Running,
            _ => ProcessorStatus::Stopped,
        }
    }
}

/// 逻辑处理器
pub struct Processor {
    /// 处理器 ID
    pub id: usize,
    /// 处理器状态
    status: AtomicU8,
    /// 本地运行队列
    pub local_queue: LocalQueue,
    /// 当前正在运行的协程
    current_co: AtomicPtr<Coroutine>,
    /// 下一个要运行的协程（让出后的快速路径）
    next_co: Mutex<Option<Arc<Coroutine>>>,
    /// 绑定的工作线程 ID
    worker_id: AtomicU64,
    /// 调度计数
    schedule_count: AtomicU64,
}

impl Processor {
    /// 创建新的处理器
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            local_queue: LocalQueue::new(),
            current_co: AtomicPtr::new(ptr::null_mut()),
            next_co: Mutex::new(None),
            worker_id: AtomicU64::new(u64::MAX),
            schedule_count: AtomicU64::new(0),
        }
    }

    /// 获取处理器状态
    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置处理器状态
    #[inline]
    pub fn set_status(&self, status: ProcessorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 获取当前协程
    #[inline]
    pub fn current(&self) -> Option<Arc<Coroutine>> {
        let ptr = self.current_co.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            unsafe {
                Arc::increment_strong_count(ptr);
                Some(Arc::from_raw(ptr))
            }
        }
    }

    /// 设置当前协程
    pub fn set_current(&self, co: Option<Arc<Coroutine>>) {
        let old_ptr = self.current_co.load(Ordering::Relaxed);

        let new_ptr = match co {
            Some(co) => Arc::into_raw(co) as *mut Coroutine,
            None => ptr::null_mut(),
        };

        self.current_co.store(new_ptr, Ordering::Release);

        // 释放旧的协程引用
        if !old_ptr.is_null() {
            unsafe {
                drop(Arc::from_raw(old_ptr));
            }
        }
    }

    /// 设置下一个要运行的协程
    pub fn set_next(&self, co: Arc<Coroutine>) {
        *self.next_co.lock() = Some(co);
    }

    /// 取出下一个要运行的协程
    pub fn take_next(&self) -> Option<Arc<Coroutine>> {
        self.next_co.lock().take()
    }

    /// 将协程加入本地队列
    pub fn push(&self, co: Arc<Coroutine>) -> bool {
        self.local_queue.push(co)
    }

    /// 从本地队列取协程
    pub fn pop(&self) -> Option<Arc<Coroutine>> {
        self.local_queue.pop()
    }

    /// 本地队列长度
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.local_queue.len()
    }

    /// 绑定工作线程
    pub fn bind_worker(&self, worker_id: u64) {
        self.worker_id.store(worker_id, Ordering::Release);
        self.set_status(ProcessorStatus::Running);
    }

    /// 绑定的工作线程 ID
    #[inline]
    pub fn worker_id(&self) -> Option<u64> {
        let id = self.worker_id.load(Ordering::Acquire);
        if id == u64::MAX {
            None
        } else {
            Some(id)
        }
    }

    #[inline]
    pub fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }

    /// 停止处理器
    pub fn stop(&self) {
        self.set_status(ProcessorStatus::Stopped);
        self.set_current(None);
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("queue_len", &self.queue_len())
            .field("worker_id", &self.worker_id())
            .finish()
    }
}

unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Drop for Processor {
    fn drop(&mut self) {
        let ptr = self.current_co.load(Ordering::Relaxed);
        if !ptr.is_null() {
            unsafe {
                drop(Arc::from_raw(ptr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::QueueBinding;
    use crate::stack::Stack;

    fn make_test_co(id: u64) -> Arc<Coroutine> {
        let stack = Stack::with_size(Stack::MIN_SIZE).unwrap();
        Arc::new(Coroutine::new(
            id,
            Box::new(|| Ok(())),
            stack,
            QueueBinding::Default,
        ))
    }

    #[test]
    fn test_processor_new() {
        let p = Processor::new(0);
        assert_eq!(p.id, 0);
        assert_eq!(p.status(), ProcessorStatus::Idle);
        assert!(p.current().is_none());
        assert!(p.worker_id().is_none());
    }

    #[test]
    fn test_processor_queue() {
        let p = Processor::new(0);

        assert!(p.push(make_test_co(1)));
        assert_eq!(p.queue_len(), 1);

        let popped = p.pop().unwrap();
        assert_eq!(popped.id(), 1);
    }

    #[test]
    fn test_processor_current() {
        let p = Processor::new(0);

        p.set_current(Some(make_test_co(1)));
        let current = p.current().unwrap();
        assert_eq!(current.id(), 1);

        p.set_current(None);
        assert!(p.current().is_none());
    }

    #[test]
    fn test_processor_next_slot() {
        let p = Processor::new(0);

        p.set_next(make_test_co(7));
        let next = p.take_next().unwrap();
        assert_eq!(next.id(), 7);
        assert!(p.take_next().is_none());
    }
}
