//! 协程执行上下文
//!
//! 封装一次可恢复的控制流：resume 与 suspend 严格交替，
//! 违反交替协议说明调度器有缺陷，直接 panic 而不是破坏内存。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, EntryFn};

/// 可恢复的执行上下文
///
/// 只保存两个栈指针槽：协程侧（suspend 时写入）和恢复者侧
/// （resume 时写入）。协议保证任一时刻只有一个线程触碰它们。
pub(crate) struct RawContext {
    /// 协程侧保存的栈指针
    co_sp: UnsafeCell<usize>,
    /// 恢复者侧保存的栈指针
    caller_sp: UnsafeCell<usize>,
    /// 是否正在运行（交替协议防护）
    entered: AtomicBool,
}

impl RawContext {
    /// 在给定栈上创建上下文，首次恢复时进入 `entry`
    pub fn new(stack_top: *mut u8, entry: EntryFn) -> Self {
        Self {
            co_sp: UnsafeCell::new(arch::prepare_stack(stack_top, entry)),
            caller_sp: UnsafeCell::new(0),
            entered: AtomicBool::new(false),
        }
    }

    /// 恢复协程执行
    ///
    /// 调用线程的控制流进入协程保存的位置，协程 suspend 或结束时返回。
    ///
    /// # Safety
    ///
    /// 只能在协程处于 Ready/Suspended 时由持有执行权的工作线程调用。
    pub unsafe fn resume(&self) {
        if self.entered.swap(true, Ordering::Acquire) {
            panic!("coroutine resumed while already running");
        }
        arch::switch_context(self.caller_sp.get(), self.co_sp.get());
        self.entered.store(false, Ordering::Release);
    }

    /// 挂起当前协程，控制流返回恢复者
    ///
    /// # Safety
    ///
    /// 只能在本上下文自己的栈上调用。
    pub unsafe fn suspend(&self) {
        debug_assert!(self.entered.load(Ordering::Relaxed));
        arch::switch_context(self.co_sp.get(), self.caller_sp.get());
    }

    /// 协程结束，切回恢复者且不再保存本侧位置
    ///
    /// # Safety
    ///
    /// 只能在本上下文自己的栈上调用，调用后协程栈不再被使用。
    pub unsafe fn finish(&self) -> ! {
        // 协程不会再恢复，保存位置写进废弃槽
        let mut scratch: usize = 0;
        arch::switch_context(&mut scratch, self.caller_sp.get());
        unreachable!("finished coroutine resumed");
    }
}

// 栈指针槽由 resume/suspend 交替协议保证单线程访问
unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}
