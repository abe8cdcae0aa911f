//! 运行队列
//!
//! 包含三种队列：
//! - `LocalQueue`：每个处理器私有的无锁环形队列，拥有者从头部操作，
//!   窃取者从尾部操作（SPMC）
//! - `GlobalQueue`：互斥锁保护的全局 FIFO，新协程从这里按提交顺序准入
//! - `DispatchQueue`：调用者可见的派发队列，串行队列保证绑定其上的
//!   协程任意时刻至多一段在执行

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::coroutine::Coroutine;

/// 本地队列容量（必须是 2 的幂）
const LOCAL_QUEUE_SIZE: usize = 256;

/// 本地运行队列
///
/// 无锁环形缓冲区，单生产者多消费者：
/// - 拥有者可以 push/pop（头部操作）
/// - 其他线程可以 steal（尾部操作）
pub struct LocalQueue {
    /// 头部索引（拥有者操作）
    head: CachePadded<AtomicU32>,
    /// 尾部索引（窃取者操作）
    tail: CachePadded<AtomicU32>,
    /// 环形缓冲区，槽内存 Arc 的原始指针
    buffer: Box<[CachePadded<AtomicUsize>; LOCAL_QUEUE_SIZE]>,
}

impl LocalQueue {
    /// 创建新的本地队列
    pub fn new() -> Self {
        // 使用 Box 分配以避免栈溢出
        let buffer: Box<[CachePadded<AtomicUsize>; LOCAL_QUEUE_SIZE]> = {
            let mut vec = Vec::with_capacity(LOCAL_QUEUE_SIZE);
            for _ in 0..LOCAL_QUEUE_SIZE {
                vec.push(CachePadded::new(AtomicUsize::new(0)));
            }
            vec.into_boxed_slice().try_into().unwrap()
        };

        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            buffer,
        }
    }

    /// 获取队列长度
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    /// 检查队列是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 推入协程（仅拥有者调用）
    ///
    /// 返回 true 表示成功，false 表示队列已满
    pub fn push(&self, co: Arc<Coroutine>) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) as usize >= LOCAL_QUEUE_SIZE {
            return false;
        }

        let idx = (head as usize) & (LOCAL_QUEUE_SIZE - 1);

        // 将 Arc 转换为原始指针存储
        let ptr = Arc::into_raw(co) as usize;
        self.buffer[idx].store(ptr, Ordering::Relaxed);

        // release 语义确保槽内写入对窃取者可见
        self.head.store(head.wrapping_add(1), Ordering::Release);

        true
    }

    /// 弹出协程（仅拥有者调用）
    pub fn pop(&self) -> Option<Arc<Coroutine>> {
        let mut head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        if head == tail {
            return None;
        }

        head = head.wrapping_sub(1);
        self.head.store(head, Ordering::Relaxed);

        let idx = (head as usize) & (LOCAL_QUEUE_SIZE - 1);
        let ptr = self.buffer[idx].load(Ordering::Relaxed);

        // 检查是否被窃取
        let new_tail = self.tail.load(Ordering::Acquire);
        if head < new_tail {
            // 该槽已被窃取，恢复头部
            self.head.store(head.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        if ptr != 0 {
            Some(unsafe { Arc::from_raw(ptr as *const Coroutine) })
        } else {
            None
        }
    }

    /// 窃取协程（其他线程调用），从尾部取一个
    pub fn steal(&self) -> Option<Arc<Coroutine>> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        if tail >= head {
            return None;
        }

        let idx = (tail as usize) & (LOCAL_QUEUE_SIZE - 1);
        let ptr = self.buffer[idx].load(Ordering::Relaxed);

        // CAS 更新尾部，竞争失败则放弃本次窃取
        if self
            .tail
            .compare_exchange(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return None;
        }

        if ptr != 0 {
            Some(unsafe { Arc::from_raw(ptr as *const Coroutine) })
        } else {
            None
        }
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        // 清理残留协程，Arc 在此释放
        while self.pop().is_some() {}
    }
}

unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

/// 全局队列（互斥锁保护的 FIFO）
pub struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Coroutine>>>,
    len: AtomicUsize,
}

impl GlobalQueue {
    /// 创建新的全局队列
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// 获取队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// 检查是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 推入协程
    pub fn push(&self, co: Arc<Coroutine>) {
        let mut queue = self.queue.lock();
        queue.push_back(co);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// 弹出协程
    pub fn pop(&self) -> Option<Arc<Coroutine>> {
        let mut queue = self.queue.lock();
        if let Some(co) = queue.pop_front() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            Some(co)
        } else {
            None
        }
    }

    /// 批量弹出
    pub fn pop_batch(&self, max: usize) -> Vec<Arc<Coroutine>> {
        let mut queue = self.queue.lock();
        let count = queue.len().min(max);
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(co) = queue.pop_front() {
                batch.push(co);
            }
        }
        self.len.fetch_sub(batch.len(), Ordering::Relaxed);
        batch
    }
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 派发队列
// ============================================================================

/// 派发队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// 串行：绑定的协程任意时刻至多一段在执行
    Serial,
    /// 并发：只保留绑定关系，不做互斥
    Concurrent,
}

/// 串行门闸
struct SerialGate {
    /// 是否有一段正在执行（或已派发待执行）
    busy: bool,
    /// 等待门闸放行的就绪协程
    pending: VecDeque<Arc<Coroutine>>,
}

struct QueueInner {
    label: String,
    kind: QueueKind,
    gate: Mutex<SerialGate>,
}

/// 调用者提供的派发队列
///
/// 克隆只复制句柄，指向同一个队列。队列不拥有协程内存，
/// 只在协程就绪待派发期间持有其引用。
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    /// 创建串行队列
    pub fn serial(label: impl Into<String>) -> Self {
        Self::with_kind(label, QueueKind::Serial)
    }

    /// 创建并发队列
    pub fn concurrent(label: impl Into<String>) -> Self {
        Self::with_kind(label, QueueKind::Concurrent)
    }

    fn with_kind(label: impl Into<String>, kind: QueueKind) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label: label.into(),
                kind,
                gate: Mutex::new(SerialGate {
                    busy: false,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// 队列标签
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// 队列类型
    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// 是否为同一个队列（按身份比较）
    pub fn same_queue(&self, other: &DispatchQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 等待门闸放行的协程数量
    pub fn pending_len(&self) -> usize {
        self.inner.gate.lock().pending.len()
    }

    /// 就绪协程经过门闸准入
    ///
    /// 返回 Some 表示该协程可以立即派发；串行队列忙碌时协程
    /// 留在 pending，等当前段结束后放行。
    pub(crate) fn admit(&self, co: Arc<Coroutine>) -> Option<Arc<Coroutine>> {
        if self.inner.kind == QueueKind::Concurrent {
            return Some(co);
        }
        let mut gate = self.inner.gate.lock();
        if gate.busy {
            gate.pending.push_back(co);
            None
        } else {
            gate.busy = true;
            Some(co)
        }
    }

    /// 当前段结束（挂起或终止），放行下一个等待者
    ///
    /// 返回 Some 表示调用方应派发该协程。
    pub(crate) fn segment_done(&self) -> Option<Arc<Coroutine>> {
        if self.inner.kind == QueueKind::Concurrent {
            return None;
        }
        let mut gate = self.inner.gate.lock();
        match gate.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                gate.busy = false;
                None
            }
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .finish()
    }
}
