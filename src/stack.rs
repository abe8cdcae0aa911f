//! 协程栈管理
//!
//! 每个协程持有一块独立的 mmap 栈内存，低地址端带一页保护页。
//! 释放的栈按大小分级回收复用，避免高频创建协程时反复进入内核。

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// 栈内存耗尽错误
#[derive(Debug, Clone)]
pub struct StackExhausted;

impl std::fmt::Display for StackExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack memory exhausted")
    }
}

impl std::error::Error for StackExhausted {}

/// 协程栈
///
/// 一块连续的 mmap 区域：最低一页是 PROT_NONE 保护页，
/// 其余部分是可用栈空间。栈从高地址向低地址增长，
/// 越界写入会命中保护页并立刻报错，而不是污染相邻内存。
pub struct Stack {
    /// 映射区基址（最低地址，保护页起点）
    base: NonNull<u8>,
    /// 映射区总大小（含保护页）
    total: usize,
    /// 保护页大小
    guard: usize,
}

impl Stack {
    /// 最小栈大小：16KB
    pub const MIN_SIZE: usize = 16 * 1024;
    /// 默认栈大小：64KB
    pub const DEFAULT_SIZE: usize = 64 * 1024;

    /// 获取系统页大小
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// 将请求的大小规整为可分配的可用栈大小
    ///
    /// 不足最小值的提升到最小值，再向上取整到整页。
    pub fn normalize_size(size: usize) -> usize {
        let page = Self::page_size();
        let size = size.max(Self::MIN_SIZE);
        (size + page - 1) & !(page - 1)
    }

    /// 创建指定可用大小的栈
    ///
    /// `size` 会先经过 [`Stack::normalize_size`] 规整。
    pub fn with_size(size: usize) -> Result<Self, StackExhausted> {
        let page = Self::page_size();
        let usable = Self::normalize_size(size);
        let total = usable + page;

        let base = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(StackExhausted);
            }
            // 最低一页设为不可访问，作为溢出保护
            if libc::mprotect(ptr, page, libc::PROT_NONE) != 0 {
                libc::munmap(ptr, total);
                return Err(StackExhausted);
            }
            NonNull::new_unchecked(ptr as *mut u8)
        };

        Ok(Self {
            base,
            total,
            guard: page,
        })
    }

    /// 栈顶地址（最高地址，mmap 保证 16 字节对齐）
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// 可用栈空间的最低地址（保护页之上）
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// 可用栈大小（不含保护页）
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("usable_size", &self.usable_size())
            .finish()
    }
}

// Stack 含原始指针，但映射区归持有者独占，移动到其他线程是安全的
unsafe impl Send for Stack {}

/// 每个大小等级最多缓存的栈块数
const MAX_CACHED_PER_CLASS: usize = 8;

/// 栈池
///
/// 按可用大小分级缓存已释放的栈。已借出（未归还）的栈计入
/// `outstanding`，协程全部结束后该计数应回到零。
pub struct StackPool {
    /// 大小等级 -> 空闲栈列表
    classes: Mutex<HashMap<usize, Vec<Stack>>>,
    /// 已借出的栈数量
    outstanding: AtomicUsize,
}

impl StackPool {
    /// 创建空的栈池
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// 借出一块至少 `size` 字节可用空间的栈
    ///
    /// 优先复用同等级的缓存块，没有则新建。
    pub fn acquire(&self, size: usize) -> Result<Stack, StackExhausted> {
        let usable = Stack::normalize_size(size);

        let cached = {
            let mut classes = self.classes.lock();
            classes.get_mut(&usable).and_then(|list| list.pop())
        };

        let stack = match cached {
            Some(stack) => stack,
            None => Stack::with_size(usable)?,
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(stack)
    }

    /// 归还一块栈
    ///
    /// 等级缓存已满时直接释放内存。
    pub fn release(&self, stack: Stack) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let usable = stack.usable_size();
        let mut classes = self.classes.lock();
        let list = classes.entry(usable).or_default();
        if list.len() < MAX_CACHED_PER_CLASS {
            list.push(stack);
        }
        // 超出缓存上限的 stack 在此 drop，munmap 归还内核
    }

    /// 当前借出未还的栈数量
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// 当前缓存的空闲栈数量
    pub fn cached(&self) -> usize {
        self.classes.lock().values().map(|v| v.len()).sum()
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}
