//! 定时器
//!
//! 单独的驱动线程维护按截止时间排序的最小堆，
//! 到期后唤醒挂起等待的协程。新注册项通过 channel 送入。

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::coroutine::Coroutine;
use crate::scheduler::Scheduler;

/// 定时器队列中的一项
struct TimerEntry {
    /// 触发时刻
    deadline: Instant,
    /// 到期后唤醒的协程
    co: Arc<Coroutine>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// 按截止时间反序比较，使 BinaryHeap 表现为最小堆
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// 定时器
pub(crate) struct Timer {
    tx: Sender<TimerEntry>,
}

impl Timer {
    /// 启动定时器驱动线程
    pub fn start(scheduler: &'static Scheduler) -> Self {
        let (tx, rx) = unbounded::<TimerEntry>();

        thread::Builder::new()
            .name("co-timer".to_string())
            .spawn(move || drive(rx, scheduler))
            .expect("failed to spawn timer thread");

        Self { tx }
    }

    /// 注册一个到期唤醒
    pub fn register(&self, deadline: Instant, co: Arc<Coroutine>) {
        // 发送失败说明驱动线程已退出，进程收尾阶段可忽略
        let _ = self.tx.send(TimerEntry { deadline, co });
    }
}

/// 驱动循环
fn drive(rx: Receiver<TimerEntry>, scheduler: &'static Scheduler) {
    let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();

    loop {
        // 先唤醒所有到期项
        let now = Instant::now();
        while let Some(entry) = heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = heap.pop().unwrap();
            // 已终止的协程（例如被取消后提前结束）直接跳过
            scheduler.unpark_co(&entry.co);
        }

        match heap.peek() {
            Some(next) => {
                let timeout = next.deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(entry) => heap.push(entry),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(entry) => heap.push(entry),
                Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::QueueBinding;
    use crate::stack::Stack;
    use std::time::Duration;

    fn make_entry(deadline: Instant) -> TimerEntry {
        let stack = Stack::with_size(Stack::MIN_SIZE).unwrap();
        TimerEntry {
            deadline,
            co: Arc::new(Coroutine::new(
                0,
                Box::new(|| Ok(())),
                stack,
                QueueBinding::Default,
            )),
        }
    }

    #[test]
    fn test_heap_is_min_heap() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();

        heap.push(make_entry(now + Duration::from_millis(30)));
        heap.push(make_entry(now + Duration::from_millis(10)));
        heap.push(make_entry(now + Duration::from_millis(20)));

        // 最早的截止时间先弹出
        let first = heap.pop().unwrap();
        assert_eq!(first.deadline, now + Duration::from_millis(10));
        let second = heap.pop().unwrap();
        assert_eq!(second.deadline, now + Duration::from_millis(20));
    }
}
