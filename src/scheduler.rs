//! 全局调度器
//!
//! 维护处理器、工作线程与全局队列，负责协程的准入、
//! 派发、窃取和终止回收。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::coroutine::{Body, CoStatus, Coroutine, QueueBinding};
use crate::handle::JoinHandle;
use crate::launch::{LaunchError, LaunchOptions};
use crate::processor::Processor;
use crate::queue::GlobalQueue;
use crate::stack::{Stack, StackPool};
use crate::timer::Timer;
use crate::worker::Worker;
use crate::CoId;

/// 全局调度器单例
///
/// 延迟初始化：首次 `get_scheduler` 时以默认配置构建。
/// 需要自定义配置时必须在任何协程启动前调用 [`configure`]。
pub static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// 获取全局调度器
pub fn get_scheduler() -> &'static Scheduler {
    SCHEDULER.get_or_init(Scheduler::new)
}

/// 以指定配置初始化全局调度器
///
/// 只有第一次初始化会生效；调度器已存在时返回 false。
pub fn configure(config: SchedulerConfig) -> bool {
    SCHEDULER.set(Scheduler::with_config(config)).is_ok()
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 工作线程数（0 表示使用 CPU 核心数）
    pub num_workers: usize,
    /// 全局队列批量获取大小
    pub global_batch_size: usize,
    /// 协程默认栈大小（字节）
    pub default_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            global_batch_size: 32,
            default_stack_size: Stack::DEFAULT_SIZE,
        }
    }
}

/// 全局调度器
pub struct Scheduler {
    /// 配置
    config: SchedulerConfig,
    /// 所有处理器
    processors: Vec<Arc<Processor>>,
    /// 所有工作线程
    workers: RwLock<Vec<Arc<Worker>>>,
    /// 全局运行队列
    global_queue: GlobalQueue,
    /// 栈池
    stack_pool: StackPool,
    /// 存活协程注册表
    registry: DashMap<CoId, Arc<Coroutine>>,
    /// 定时器（延迟启动）
    timer: OnceLock<Timer>,
    /// 协程 ID 计数器
    next_coid: AtomicU64,
    /// 存活协程数量
    live: AtomicU64,
    /// 工作线程是否已启动
    started: AtomicBool,
}

impl Scheduler {
    /// 以默认配置创建调度器
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// 以指定配置创建调度器
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        if config.num_workers == 0 {
            config.num_workers = num_cpus::get();
        }
        let num_p = config.num_workers;

        let processors: Vec<_> = (0..num_p).map(|id| Arc::new(Processor::new(id))).collect();

        Self {
            config,
            processors,
            workers: RwLock::new(Vec::new()),
            global_queue: GlobalQueue::new(),
            stack_pool: StackPool::new(),
            registry: DashMap::new(),
            timer: OnceLock::new(),
            next_coid: AtomicU64::new(1),
            live: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// 生成新的协程 ID
    #[inline]
    pub fn next_coid(&self) -> CoId {
        self.next_coid.fetch_add(1, Ordering::Relaxed)
    }

    /// 存活协程数量
    #[inline]
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// 按 ID 查找存活协程
    pub(crate) fn find(&self, id: CoId) -> Option<Arc<Coroutine>> {
        self.registry.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 首次使用时启动工作线程
    fn ensure_started(&'static self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.write();
        for (i, p) in self.processors.iter().enumerate() {
            let w = Worker::new(i as u64, Arc::clone(p), self);
            w.start();
            workers.push(w);
        }
        tracing::debug!(workers = self.processors.len(), "scheduler started");
    }

    /// 创建并调度新协程
    pub(crate) fn spawn(
        &'static self,
        opts: LaunchOptions,
        body: Body,
    ) -> Result<JoinHandle, LaunchError> {
        let stack_size = opts
            .stack_size
            .unwrap_or(self.config.default_stack_size);
        if stack_size < Stack::MIN_SIZE {
            // 配置错误同步报告给启动方，不进入协程体
            return Err(LaunchError::StackTooSmall {
                requested: stack_size,
                min: Stack::MIN_SIZE,
            });
        }

        self.ensure_started();

        let stack = self
            .stack_pool
            .acquire(stack_size)
            .map_err(|_| LaunchError::StackExhausted)?;

        let binding = match opts.queue {
            Some(q) => QueueBinding::Custom(q),
            None => QueueBinding::Default,
        };

        let co = Arc::new(Coroutine::new(self.next_coid(), body, stack, binding));
        self.registry.insert(co.id(), Arc::clone(&co));
        self.live.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(id = co.id(), stack = stack_size, "coroutine launched");

        self.submit(Arc::clone(&co));
        Ok(JoinHandle::new(co))
    }

    /// 就绪协程进入调度
    ///
    /// 绑定了派发队列的协程先过队列门闸，其余直接派发。
    pub(crate) fn submit(&self, co: Arc<Coroutine>) {
        match co.binding() {
            QueueBinding::Default => self.dispatch(co),
            QueueBinding::Custom(q) => {
                if let Some(admitted) = q.admit(co) {
                    self.dispatch(admitted);
                }
            }
        }
    }

    /// 把协程放入全局队列并唤醒一个工作线程
    pub(crate) fn dispatch(&self, co: Arc<Coroutine>) {
        self.global_queue.push(co);
        self.wake_worker();
    }

    /// 全局队列是否有就绪协程
    #[inline]
    pub(crate) fn has_global_ready(&self) -> bool {
        !self.global_queue.is_empty()
    }

    /// 批量从全局队列获取
    pub(crate) fn take_global_batch(&self) -> Vec<Arc<Coroutine>> {
        self.global_queue.pop_batch(self.config.global_batch_size)
    }

    /// 工作窃取
    pub(crate) fn steal_work(&self, thief: &Processor) -> Option<Arc<Coroutine>> {
        let num_p = self.processors.len();
        if num_p <= 1 {
            return None;
        }
        let start = thief.id;

        // 随机选择起点，避免总是从同一个处理器窃取
        let random_offset = (thief.schedule_count() as usize) % num_p;

        for i in 0..num_p {
            let offset = (random_offset + i + 1) % num_p;
            let idx = (start + offset) % num_p;

            if idx == thief.id {
                continue;
            }

            if let Some(victim) = self.processors.get(idx) {
                // 只有当 victim 队列有足够多的任务时才窃取
                if victim.queue_len() > 1 {
                    if let Some(co) = victim.local_queue.steal() {
                        return Some(co);
                    }
                }
            }
        }

        // 最后再尝试从任何有任务的处理器窃取
        for offset in 1..num_p {
            let idx = (start + offset) % num_p;
            if let Some(victim) = self.processors.get(idx) {
                if let Some(co) = victim.local_queue.steal() {
                    return Some(co);
                }
            }
        }

        None
    }

    /// 唤醒一个休眠中的工作线程
    fn wake_worker(&self) {
        let workers = self.workers.read();
        for w in workers.iter() {
            if w.is_parking() {
                w.unpark();
                break;
            }
        }
    }

    /// 唤醒挂起的协程
    ///
    /// 协程已终止时返回 false。挂起尚未完成时记录待唤醒标记，
    /// 由工作线程在切出完成后补上，保证唤醒不丢失。
    pub(crate) fn unpark_co(&self, co: &Arc<Coroutine>) -> bool {
        loop {
            match co.status() {
                CoStatus::Suspended => {
                    if co.make_ready().unwrap_or(false) {
                        self.submit(Arc::clone(co));
                        return true;
                    }
                    // CAS 失败，状态已被别处改变，重新判定
                }
                CoStatus::Running => {
                    co.set_wake_pending();
                    if co.status() != CoStatus::Running {
                        // 正好完成切出，回到循环消费这次唤醒
                        continue;
                    }
                    return true;
                }
                CoStatus::Ready => return true,
                _ => return false,
            }
        }
    }

    /// 协程终止后的回收
    pub(crate) fn finish_coroutine(&self, co: &Arc<Coroutine>) {
        // 栈在协程切出后才可回收
        if let Some(stack) = co.take_stack() {
            self.stack_pool.release(stack);
        }

        self.registry.remove(&co.id());
        self.live.fetch_sub(1, Ordering::Relaxed);

        co.notify_done();
        for waiter in co.drain_waiters() {
            self.unpark_co(&waiter);
        }

        // 无人观察的失败在此记录
        if co.is_detached() {
            co.log_unobserved();
        }

        tracing::trace!(
            id = co.id(),
            status = ?co.status(),
            segments = co.schedule_count(),
            "coroutine finished"
        );
    }

    /// 获取定时器（首次使用时启动驱动线程）
    pub(crate) fn timer(&'static self) -> &Timer {
        self.timer.get_or_init(|| Timer::start(self))
    }

    /// 停止调度器
    ///
    /// 只在进程收尾时使用；停止后不能再启动协程。
    pub fn stop(&self) {
        let workers = self.workers.read();
        for w in workers.iter() {
            w.stop();
        }
        for w in workers.iter() {
            w.join();
        }
        for p in &self.processors {
            p.stop();
        }
    }

    /// 栈池借出计数（诊断用）
    #[inline]
    pub fn outstanding_stacks(&self) -> usize {
        self.stack_pool.outstanding()
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let mut total_local = 0;
        let mut schedule_counts = Vec::new();

        for p in &self.processors {
            total_local += p.queue_len();
            schedule_counts.push(p.schedule_count());
        }

        SchedulerStats {
            live: self.live_count(),
            global_queue_len: self.global_queue.len(),
            total_local_queue_len: total_local,
            processor_schedule_counts: schedule_counts,
            outstanding_stacks: self.stack_pool.outstanding(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// 调度统计信息
#[derive(Debug)]
pub struct SchedulerStats {
    pub live: u64,
    pub global_queue_len: usize,
    pub total_local_queue_len: usize,
    pub processor_schedule_counts: Vec<u64>,
    pub outstanding_stacks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_new() {
        let scheduler = Scheduler::new();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.outstanding_stacks(), 0);
    }

    #[test]
    fn test_scheduler_coid() {
        let scheduler = Scheduler::new();
        let id1 = scheduler.next_coid();
        let id2 = scheduler.next_coid();
        assert_eq!(id1 + 1, id2);
    }

    #[test]
    fn test_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.num_workers > 0);
        assert_eq!(config.default_stack_size, Stack::DEFAULT_SIZE);
    }

    #[test]
    fn test_config_zero_workers_uses_cpus() {
        let scheduler = Scheduler::with_config(SchedulerConfig {
            num_workers: 0,
            ..SchedulerConfig::default()
        });
        assert_eq!(scheduler.processors.len(), num_cpus::get());
    }

    #[test]
    fn test_stop_before_start() {
        use crate::processor::ProcessorStatus;

        let scheduler = Scheduler::new();
        scheduler.stop();
        for p in &scheduler.processors {
            assert_eq!(p.status(), ProcessorStatus::Stopped);
        }
    }

    #[test]
    fn test_stats_empty() {
        let scheduler = Scheduler::new();
        let stats = scheduler.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.global_queue_len, 0);
        assert_eq!(stats.total_local_queue_len, 0);
    }
}
