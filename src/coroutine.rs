//! 协程结构
//!
//! 调度的基本单位：一段可挂起/恢复的控制流，携带自己的栈、
//! 状态机、队列绑定和失败结果槽。

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context::RawContext;
use crate::queue::DispatchQueue;
use crate::stack::Stack;
use crate::CoId;

/// 协程体：零参数的可失败操作
pub(crate) type Body = Box<dyn FnOnce() -> Result<(), CoError> + Send + 'static>;

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoStatus {
    /// 已创建，等待首次调度
    Ready = 0,
    /// 正在某个工作线程上执行
    Running = 1,
    /// 已让出控制权，可再次恢复
    Suspended = 2,
    /// 协程体正常返回
    Completed = 3,
    /// 协程体以错误结束
    Failed = 4,
}

impl From<u8> for CoStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => CoStatus::Ready,
            1 => CoStatus::Running,
            2 => CoStatus::Suspended,
            3 => CoStatus::Completed,
            _ => CoStatus::Failed,
        }
    }
}

impl CoStatus {
    /// 是否为终止状态
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, CoStatus::Completed | CoStatus::Failed)
    }
}

/// 协程体的失败结果
#[derive(Debug)]
pub enum CoError {
    /// 协程被取消，在挂起点观察到取消标记
    Cancelled,
    /// 协程体 panic，携带 panic 信息
    Panicked(String),
    /// 协程体返回的错误
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl CoError {
    /// 用一条消息构造错误
    pub fn msg(message: impl Into<String>) -> Self {
        CoError::Failed(Box::new(Message(message.into())))
    }

    /// 包装任意错误类型
    pub fn wrap<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CoError::Failed(Box::new(err))
    }
}

impl std::fmt::Display for CoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoError::Cancelled => write!(f, "coroutine cancelled"),
            CoError::Panicked(msg) => write!(f, "coroutine panicked: {}", msg),
            CoError::Failed(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoError::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<String> for CoError {
    fn from(s: String) -> Self {
        CoError::msg(s)
    }
}

impl From<&str> for CoError {
    fn from(s: &str) -> Self {
        CoError::msg(s)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for CoError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        CoError::Failed(err)
    }
}

/// 简单的消息错误
#[derive(Debug)]
struct Message(String);

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Message {}

/// 非法状态迁移错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// 目标协程已处于终止状态，不允许再次就绪/恢复
    Terminal(CoStatus),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Terminal(s) => {
                write!(f, "coroutine already terminal ({:?})", s)
            }
        }
    }
}

impl std::error::Error for StateError {}

/// 队列绑定
#[derive(Clone)]
pub(crate) enum QueueBinding {
    /// 默认全局队列，任意工作线程均可执行
    Default,
    /// 绑定到调用者提供的队列
    Custom(DispatchQueue),
}

/// 挂起原因，由挂起点写入、工作线程在切回后读取
pub(crate) enum SwitchIntent {
    /// 主动让出，立即重新就绪
    Yield,
    /// 等待外部唤醒
    Park,
    /// 迁移到另一个队列后重新就绪
    Hop(DispatchQueue),
}

/// 一次恢复的结果，由工作线程根据状态与挂起原因归纳
pub(crate) enum RunOutcome {
    Yielded,
    Parked,
    Hopped(DispatchQueue),
    Finished,
}

/// 协程
pub struct Coroutine {
    /// 协程唯一 ID
    pub(crate) id: CoId,
    /// 协程状态（原子操作）
    status: AtomicU8,
    /// 底层可恢复上下文
    raw: RawContext,
    /// 协程栈，终止后被取走归还栈池
    stack: Mutex<Option<Stack>>,
    /// 待执行的协程体，首次恢复时取走
    body: Mutex<Option<Body>>,
    /// 失败/完成结果，只交付一次
    result: Mutex<Option<Result<(), CoError>>>,
    /// 队列绑定
    binding: Mutex<QueueBinding>,
    /// 本次挂起的原因
    intent: Mutex<Option<SwitchIntent>>,
    /// 取消标记
    cancel: AtomicBool,
    /// 观察句柄是否已丢弃
    detached: AtomicBool,
    /// 挂起尚未完成时收到的唤醒
    wake_pending: AtomicBool,
    /// 是否已开始执行
    started: AtomicBool,
    /// 等待本协程结束的协程
    waiters: Mutex<Vec<Arc<Coroutine>>>,
    /// 线程侧 join 的同步
    done_lock: Mutex<bool>,
    done_cond: Condvar,
    /// 调度次数
    schedule_count: AtomicU64,
}

impl Coroutine {
    /// 创建新协程，初始状态为 Ready
    pub(crate) fn new(id: CoId, body: Body, stack: Stack, binding: QueueBinding) -> Self {
        let raw = RawContext::new(stack.top(), coroutine_entry);
        Self {
            id,
            status: AtomicU8::new(CoStatus::Ready as u8),
            raw,
            stack: Mutex::new(Some(stack)),
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            binding: Mutex::new(binding),
            intent: Mutex::new(None),
            cancel: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            started: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
            done_lock: Mutex::new(false),
            done_cond: Condvar::new(),
            schedule_count: AtomicU64::new(0),
        }
    }

    /// 获取协程 ID
    #[inline]
    pub fn id(&self) -> CoId {
        self.id
    }

    /// 获取协程状态
    #[inline]
    pub fn status(&self) -> CoStatus {
        CoStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置协程状态
    #[inline]
    pub(crate) fn set_status(&self, status: CoStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub(crate) fn cas_status(&self, expected: CoStatus, new: CoStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 检查是否已终止
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// 尝试把挂起的协程转为就绪
    ///
    /// 返回 Ok(true) 表示本次调用完成了迁移（调用方负责入队），
    /// Ok(false) 表示协程已就绪或仍在运行。终止状态下返回
    /// [`StateError::Terminal`]，而不是静默忽略。
    pub(crate) fn make_ready(&self) -> Result<bool, StateError> {
        match self.status() {
            CoStatus::Suspended => Ok(self.cas_status(CoStatus::Suspended, CoStatus::Ready)),
            CoStatus::Ready | CoStatus::Running => Ok(false),
            s => Err(StateError::Terminal(s)),
        }
    }

    /// 记录终止结果并进入终止状态
    ///
    /// 先写结果槽再发布状态，观察到终止状态的一方必定能看到结果。
    pub(crate) fn complete(&self, result: Result<(), CoError>) {
        let status = if result.is_ok() {
            CoStatus::Completed
        } else {
            CoStatus::Failed
        };
        {
            let mut slot = self.result.lock();
            debug_assert!(slot.is_none(), "coroutine result written twice");
            *slot = Some(result);
        }
        self.set_status(status);
    }

    /// 取走终止结果（只交付一次）
    pub(crate) fn take_result(&self) -> Option<Result<(), CoError>> {
        self.result.lock().take()
    }

    /// 请求取消
    #[inline]
    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// 是否已请求取消
    #[inline]
    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// 是否已开始执行过
    #[inline]
    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 标记观察句柄已丢弃；若已失败则立刻记录
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        if self.is_terminal() {
            self.log_unobserved();
        }
    }

    #[inline]
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// 无人观察的失败不静默丢弃，记录日志后释放
    pub(crate) fn log_unobserved(&self) {
        if let Some(Err(err)) = self.take_result() {
            tracing::error!(id = self.id, error = %err, "coroutine failed with no observer");
        }
    }

    /// 设置/清除挂起期间到达的唤醒
    #[inline]
    pub(crate) fn set_wake_pending(&self) {
        self.wake_pending.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_wake_pending(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }

    /// 当前队列绑定
    pub(crate) fn binding(&self) -> QueueBinding {
        self.binding.lock().clone()
    }

    /// 重新绑定队列（只在协程自身挂起后由工作线程调用）
    pub(crate) fn rebind(&self, binding: QueueBinding) {
        *self.binding.lock() = binding;
    }

    /// 注册一个等待本协程结束的协程
    ///
    /// 已终止时返回 false，调用方不应再挂起等待。
    pub(crate) fn push_waiter(&self, waiter: Arc<Coroutine>) -> bool {
        let mut waiters = self.waiters.lock();
        if self.is_terminal() {
            return false;
        }
        waiters.push(waiter);
        true
    }

    /// 取出全部等待者
    pub(crate) fn drain_waiters(&self) -> Vec<Arc<Coroutine>> {
        std::mem::take(&mut *self.waiters.lock())
    }

    /// 取走协程栈（终止后归还栈池）
    pub(crate) fn take_stack(&self) -> Option<Stack> {
        self.stack.lock().take()
    }

    /// 通知线程侧的 join 等待者
    pub(crate) fn notify_done(&self) {
        let mut done = self.done_lock.lock();
        *done = true;
        self.done_cond.notify_all();
    }

    /// 阻塞当前线程直到协程终止（线程侧 join）
    pub(crate) fn wait_done(&self) {
        let mut done = self.done_lock.lock();
        while !*done {
            self.done_cond.wait(&mut done);
        }
    }

    #[inline]
    pub(crate) fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// 栈与上下文由 resume/suspend 协议保证同一时刻只有一个线程触碰
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

thread_local! {
    /// 当前线程正在执行的协程
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

/// 获取当前线程正在执行的协程
pub(crate) fn current() -> Option<Arc<Coroutine>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// 恢复协程执行，返回本段执行的结果
///
/// 由工作线程调用；调用前协程必须已通过 CAS 进入 Running。
pub(crate) fn resume(co: &Arc<Coroutine>) -> RunOutcome {
    debug_assert_eq!(co.status(), CoStatus::Running);

    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(co)));
    co.started.store(true, Ordering::Release);

    unsafe { co.raw.resume() };

    CURRENT.with(|c| *c.borrow_mut() = None);

    if co.is_terminal() {
        return RunOutcome::Finished;
    }
    match co.intent.lock().take() {
        Some(SwitchIntent::Yield) => RunOutcome::Yielded,
        Some(SwitchIntent::Park) => RunOutcome::Parked,
        Some(SwitchIntent::Hop(q)) => RunOutcome::Hopped(q),
        None => panic!("coroutine suspended without recording an intent"),
    }
}

/// 挂起当前协程，记录挂起原因
///
/// 只能在协程自己的栈上调用；恢复后从此处继续。
pub(crate) fn suspend_current(co: &Arc<Coroutine>, intent: SwitchIntent) {
    *co.intent.lock() = Some(intent);
    unsafe { co.raw.suspend() };
}

/// 协程入口
///
/// 通过线程本地变量取得当前协程，执行协程体并捕获 panic，
/// 记录终止结果后切回工作线程。
extern "C" fn coroutine_entry() -> ! {
    let co = current().expect("coroutine entry without a current coroutine");
    let body = co
        .body
        .lock()
        .take()
        .expect("coroutine entered without a body");

    let result = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(r) => r,
        Err(payload) => Err(CoError::Panicked(panic_message(payload.as_ref()))),
    };

    co.complete(result);

    // 切回前释放本地 Arc，工作线程的 resume 帧仍持有引用
    let raw = &co.raw as *const RawContext;
    drop(co);
    unsafe { (*raw).finish() }
}

/// 从 panic 载荷中提取可读信息
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_co(id: CoId) -> Coroutine {
        let stack = Stack::with_size(Stack::MIN_SIZE).unwrap();
        Coroutine::new(id, Box::new(|| Ok(())), stack, QueueBinding::Default)
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(CoStatus::from(0), CoStatus::Ready);
        assert_eq!(CoStatus::from(1), CoStatus::Running);
        assert_eq!(CoStatus::from(2), CoStatus::Suspended);
        assert_eq!(CoStatus::from(3), CoStatus::Completed);
        assert_eq!(CoStatus::from(4), CoStatus::Failed);
    }

    #[test]
    fn test_new_is_ready() {
        let co = make_test_co(1);
        assert_eq!(co.status(), CoStatus::Ready);
        assert!(!co.is_terminal());
        assert!(!co.has_started());
    }

    #[test]
    fn test_cas_status() {
        let co = make_test_co(2);
        assert!(co.cas_status(CoStatus::Ready, CoStatus::Running));
        assert!(!co.cas_status(CoStatus::Ready, CoStatus::Running));
        assert_eq!(co.status(), CoStatus::Running);
    }

    #[test]
    fn test_complete_failed() {
        let co = make_test_co(3);
        co.complete(Err(CoError::msg("boom")));
        assert_eq!(co.status(), CoStatus::Failed);

        // 结果只交付一次
        let result = co.take_result().unwrap();
        assert!(result.is_err());
        assert!(co.take_result().is_none());
    }

    #[test]
    fn test_make_ready_terminal_is_error() {
        let co = make_test_co(4);
        co.complete(Ok(()));

        // 终止后的再次就绪必须报非法状态，而不是静默忽略
        match co.make_ready() {
            Err(StateError::Terminal(s)) => assert_eq!(s, CoStatus::Completed),
            other => panic!("expected terminal error, got {:?}", other),
        }
    }

    #[test]
    fn test_make_ready_from_suspended() {
        let co = make_test_co(5);
        co.set_status(CoStatus::Suspended);
        assert_eq!(co.make_ready(), Ok(true));
        assert_eq!(co.status(), CoStatus::Ready);
        // 已就绪时是无害的 Ok(false)
        assert_eq!(co.make_ready(), Ok(false));
    }

    #[test]
    fn test_push_waiter_after_terminal() {
        let co = make_test_co(6);
        let waiter = Arc::new(make_test_co(7));
        co.complete(Ok(()));
        assert!(!co.push_waiter(waiter));
        assert!(co.drain_waiters().is_empty());
    }

    #[test]
    fn test_cancel_flag() {
        let co = make_test_co(8);
        assert!(!co.cancel_requested());
        co.request_cancel();
        assert!(co.cancel_requested());
    }

    #[test]
    fn test_co_error_display() {
        assert_eq!(format!("{}", CoError::Cancelled), "coroutine cancelled");
        let err = CoError::msg("fetch failed");
        assert_eq!(format!("{}", err), "fetch failed");
        let err: CoError = "oops".into();
        assert!(format!("{}", err).contains("oops"));
    }
}
