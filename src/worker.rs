//! 工作线程
//!
//! 操作系统线程，循环取出就绪协程并恢复执行。
//! 找不到工作时休眠，由调度器在新工作到达时唤醒。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::coroutine::{self, CoError, CoStatus, Coroutine, QueueBinding, RunOutcome};
use crate::processor::Processor;
use crate::queue::QueueKind;
use crate::scheduler::Scheduler;

/// 工作线程
pub(crate) struct Worker {
    /// 线程 ID
    pub id: u64,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 绑定的处理器
    processor: Arc<Processor>,
    /// 是否正在休眠
    parking: AtomicBool,
    /// 是否应该停止
    should_stop: AtomicBool,
    /// 休眠/唤醒同步
    park_mutex: Mutex<bool>,
    park_cond: Condvar,
    /// 关联的调度器
    scheduler: &'static Scheduler,
}

impl Worker {
    /// 创建新的工作线程
    pub fn new(id: u64, processor: Arc<Processor>, scheduler: &'static Scheduler) -> Arc<Self> {
        processor.bind_worker(id);
        Arc::new(Self {
            id,
            thread: Mutex::new(None),
            processor,
            parking: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            park_mutex: Mutex::new(false),
            park_cond: Condvar::new(),
            scheduler,
        })
    }

    /// 启动工作线程
    pub fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || {
                worker.run_loop();
            })
            .expect("failed to spawn worker thread");

        *self.thread.lock() = Some(handle);
    }

    /// 主执行循环
    fn run_loop(&self) {
        tracing::debug!(id = self.id, "worker started");
        loop {
            if self.should_stop.load(Ordering::Relaxed) {
                break;
            }

            if let Some(co) = self.find_work() {
                self.run(co);
            } else {
                self.park_if_idle();
            }
        }
        tracing::debug!(id = self.id, "worker stopped");
    }

    /// 查找可执行的协程
    ///
    /// 顺序：next 槽 -> 本地队列 -> 全局队列批量补充 -> 窃取。
    fn find_work(&self) -> Option<Arc<Coroutine>> {
        let p = &self.processor;

        if let Some(co) = p.take_next() {
            return Some(co);
        }

        if let Some(co) = p.pop() {
            return Some(co);
        }

        // 从全局队列批量补充，首个直接执行，其余进本地队列
        let batch = self.scheduler.take_global_batch();
        if !batch.is_empty() {
            let mut iter = batch.into_iter();
            let first = iter.next();
            for co in iter {
                if !p.push(co.clone()) {
                    self.scheduler.dispatch(co);
                }
            }
            return first;
        }

        self.scheduler.steal_work(p)
    }

    /// 执行协程的一段
    fn run(&self, co: Arc<Coroutine>) {
        // 已请求取消且尚未开始的协程不进入协程体，直接按取消终止
        if co.cancel_requested() && !co.has_started() {
            if !co.cas_status(CoStatus::Ready, CoStatus::Running) {
                panic!(
                    "coroutine {} dispatched in state {:?}",
                    co.id(),
                    co.status()
                );
            }
            co.complete(Err(CoError::Cancelled));
            self.finish_segment_of(&co);
            self.scheduler.finish_coroutine(&co);
            return;
        }

        if !co.cas_status(CoStatus::Ready, CoStatus::Running) {
            // 同一协程被重复派发，调度器不变量已被破坏
            panic!(
                "coroutine {} resumed in state {:?}",
                co.id(),
                co.status()
            );
        }

        self.processor.set_current(Some(Arc::clone(&co)));
        self.processor.inc_schedule_count();
        co.inc_schedule_count();

        let outcome = coroutine::resume(&co);

        self.processor.set_current(None);

        match outcome {
            RunOutcome::Finished => {
                self.finish_segment_of(&co);
                self.scheduler.finish_coroutine(&co);
            }
            RunOutcome::Yielded => {
                co.set_status(CoStatus::Suspended);
                match co.binding() {
                    QueueBinding::Custom(q) if q.kind() == QueueKind::Serial => {
                        // 先放行队列中的等待者，让出者排到它们之后
                        if let Some(next) = q.segment_done() {
                            self.scheduler.dispatch(next);
                        }
                        if self.ready_again(&co) {
                            if let Some(admitted) = q.admit(co) {
                                self.scheduler.dispatch(admitted);
                            }
                        }
                    }
                    _ => {
                        if self.ready_again(&co) {
                            self.dispatch_hot(co);
                        }
                    }
                }
            }
            RunOutcome::Parked => {
                co.set_status(CoStatus::Suspended);
                self.finish_segment_of(&co);
                // 挂起期间到达的唤醒在此补上，避免丢失
                if co.take_wake_pending() && co.make_ready().unwrap_or(false) {
                    self.scheduler.submit(co);
                }
            }
            RunOutcome::Hopped(target) => {
                co.set_status(CoStatus::Suspended);
                self.finish_segment_of(&co);
                co.rebind(QueueBinding::Custom(target));
                if self.ready_again(&co) {
                    self.scheduler.submit(co);
                }
            }
        }
    }

    /// 让出的协程重新就绪
    ///
    /// CAS 失败说明取消唤醒已抢先就绪并入队（甚至已在别的线程
    /// 上跑完），本侧跳过，保证不重复入队。
    fn ready_again(&self, co: &Arc<Coroutine>) -> bool {
        co.make_ready().unwrap_or(false)
    }

    /// 串行队列的当前段结束，放行下一个等待者
    fn finish_segment_of(&self, co: &Coroutine) {
        if let QueueBinding::Custom(q) = co.binding() {
            if let Some(next) = q.segment_done() {
                self.scheduler.dispatch(next);
            }
        }
    }

    /// 让出协程的快速路径：优先放入 next 槽，下轮立即执行
    fn dispatch_hot(&self, co: Arc<Coroutine>) {
        self.processor.set_next(co);
    }

    /// 无工作时休眠
    fn park_if_idle(&self) {
        self.parking.store(true, Ordering::SeqCst);

        // 设置休眠标记后再检查一次全局队列，避免错过唤醒窗口
        if !self.scheduler.has_global_ready() {
            let mut guard = self.park_mutex.lock();
            while !*guard && !self.should_stop.load(Ordering::Relaxed) {
                self.park_cond.wait(&mut guard);
            }
            *guard = false;
        }

        self.parking.store(false, Ordering::SeqCst);
    }

    /// 唤醒线程
    pub fn unpark(&self) {
        let mut guard = self.park_mutex.lock();
        *guard = true;
        self.park_cond.notify_one();
    }

    /// 检查是否正在休眠
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.parking.load(Ordering::SeqCst)
    }

    /// 停止工作线程
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.unpark();
    }

    /// 等待线程结束
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("parking", &self.is_parking())
            .finish()
    }
}
