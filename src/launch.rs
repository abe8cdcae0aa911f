//! 协程启动 API
//!
//! `launch` 一族是运行时的公共入口：启动一个可挂起的协程体，
//! 可选绑定派发队列、可选指定栈大小。调用立即返回，句柄可丢弃。
//! 另提供协程内可用的挂起点：`yield_now`、`sleep`、`hop_to`。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::coroutine::{self, CoError, SwitchIntent};
use crate::handle::JoinHandle;
use crate::queue::DispatchQueue;
use crate::scheduler::get_scheduler;
use crate::CoId;

/// 启动配置错误
///
/// 同步报告给启动方，协程体不会开始执行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// 请求的栈小于运行时要求的最小值
    StackTooSmall { requested: usize, min: usize },
    /// 栈内存分配失败
    StackExhausted,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::StackTooSmall { requested, min } => {
                write!(f, "stack size {} below minimum {}", requested, min)
            }
            LaunchError::StackExhausted => write!(f, "stack memory exhausted"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// 启动选项
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// 绑定的派发队列，None 表示默认全局队列
    pub queue: Option<DispatchQueue>,
    /// 栈大小覆盖（字节），None 表示使用默认值
    pub stack_size: Option<usize>,
}

/// 在默认队列上启动协程
pub fn launch<F>(body: F) -> Result<JoinHandle, LaunchError>
where
    F: FnOnce() -> Result<(), CoError> + Send + 'static,
{
    launch_with(LaunchOptions::default(), body)
}

/// 在指定队列上启动协程
pub fn launch_on<F>(queue: &DispatchQueue, body: F) -> Result<JoinHandle, LaunchError>
where
    F: FnOnce() -> Result<(), CoError> + Send + 'static,
{
    launch_with(
        LaunchOptions {
            queue: Some(queue.clone()),
            stack_size: None,
        },
        body,
    )
}

/// 以完整选项启动协程
pub fn launch_with<F>(opts: LaunchOptions, body: F) -> Result<JoinHandle, LaunchError>
where
    F: FnOnce() -> Result<(), CoError> + Send + 'static,
{
    get_scheduler().spawn(opts, Box::new(body))
}

/// 当前协程主动让出
///
/// 协程重新排队，同队列的其他就绪协程得到执行机会。
/// 已请求取消时返回 [`CoError::Cancelled`]。
/// 在协程外调用退化为线程让出。
pub fn yield_now() -> Result<(), CoError> {
    match coroutine::current() {
        None => {
            thread::yield_now();
            Ok(())
        }
        Some(co) => {
            if co.cancel_requested() {
                return Err(CoError::Cancelled);
            }
            coroutine::suspend_current(&co, SwitchIntent::Yield);
            if co.cancel_requested() {
                Err(CoError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

/// 当前协程休眠指定时长
///
/// 挂起而不阻塞工作线程；取消请求会提前唤醒并返回
/// [`CoError::Cancelled`]。在协程外调用退化为线程休眠。
pub fn sleep(duration: Duration) -> Result<(), CoError> {
    match coroutine::current() {
        None => {
            thread::sleep(duration);
            Ok(())
        }
        Some(co) => {
            let deadline = Instant::now() + duration;
            loop {
                if co.cancel_requested() {
                    return Err(CoError::Cancelled);
                }
                if Instant::now() >= deadline {
                    return Ok(());
                }
                get_scheduler().timer().register(deadline, Arc::clone(&co));
                coroutine::suspend_current(&co, SwitchIntent::Park);
            }
        }
    }
}

/// 把当前协程迁移到另一个队列
///
/// 在当前挂起点之后，协程的恢复经由目标队列派发。
/// 只能在协程内调用。
pub fn hop_to(queue: &DispatchQueue) -> Result<(), CoError> {
    match coroutine::current() {
        None => Err(CoError::msg("hop_to called outside a coroutine")),
        Some(co) => {
            if co.cancel_requested() {
                return Err(CoError::Cancelled);
            }
            coroutine::suspend_current(&co, SwitchIntent::Hop(queue.clone()));
            if co.cancel_requested() {
                Err(CoError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

/// 当前协程是否已被请求取消
pub fn is_cancelled() -> bool {
    coroutine::current()
        .map(|co| co.cancel_requested())
        .unwrap_or(false)
}

/// 当前协程 ID（协程外返回 None）
pub fn current_id() -> Option<CoId> {
    coroutine::current().map(|co| co.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

    #[test]
    fn test_launch_completes() {
        let handle = launch(|| Ok(())).unwrap();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_launch_many_default_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            let handle = launch(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
            ids.push(handle.id());
            handles.push(handle);
        }

        for handle in handles {
            assert!(handle.join().is_ok());
        }

        // 每个协程恰好执行一次，且注册表中无残留
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        for id in ids {
            assert!(get_scheduler().find(id).is_none());
        }
    }

    #[test]
    fn test_fire_and_forget() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        // 句柄直接丢弃
        drop(launch(move || {
            flag.store(true, Ordering::Release);
            Ok(())
        }));

        let start = Instant::now();
        while !done.load(Ordering::Acquire) {
            assert!(start.elapsed() < Duration::from_secs(5), "coroutine never ran");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_body_error_captured() {
        let handle = launch(|| Err(CoError::msg("fetch failed"))).unwrap();

        let err = handle.join().unwrap_err();
        assert!(format!("{}", err).contains("fetch failed"));
    }

    #[test]
    fn test_body_panic_captured() {
        let handle = launch(|| {
            panic!("boom");
        })
        .unwrap();

        match handle.join() {
            Err(CoError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected panic capture, got {:?}", other),
        }
    }

    #[test]
    fn test_stack_too_small_rejected() {
        let result = launch_with(
            LaunchOptions {
                queue: None,
                stack_size: Some(1024),
            },
            || Ok(()),
        );

        match result {
            Err(LaunchError::StackTooSmall { requested, .. }) => assert_eq!(requested, 1024),
            other => panic!("expected StackTooSmall, got {:?}", other.map(|h| h.id())),
        }
    }

    #[test]
    fn test_stack_size_override() {
        // 每帧吃掉至少 1KB，64 层超过默认 64KB 栈，但在 128KB 覆盖内
        fn recurse(depth: usize) -> u64 {
            let mut buf = [0u8; 1024];
            buf[0] = depth as u8;
            std::hint::black_box(&mut buf);
            if depth == 0 {
                buf[0] as u64
            } else {
                recurse(depth - 1) + buf[0] as u64
            }
        }

        let handle = launch_with(
            LaunchOptions {
                queue: None,
                stack_size: Some(128 * 1024),
            },
            || {
                let sum = recurse(64);
                std::hint::black_box(sum);
                Ok(())
            },
        )
        .unwrap();

        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_serial_queue_mutual_exclusion() {
        let q = DispatchQueue::serial("exclusion");
        let active = Arc::new(AtomicI32::new(0));
        let max_seen = Arc::new(AtomicI32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let handle = launch_on(&q, move || {
                for _ in 0..10 {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    // 段内结束前归零，让出是段边界
                    active.fetch_sub(1, Ordering::SeqCst);
                    yield_now()?;
                }
                Ok(())
            })
            .unwrap();
            handles.push(handle);
        }

        for handle in handles {
            assert!(handle.join().is_ok());
        }

        // 串行队列上任意时刻至多一段在执行
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serial_queue_suspension_ordering() {
        let q = DispatchQueue::serial("ordering");
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let ev = Arc::clone(&events);
        let a = launch_on(&q, move || {
            ev.lock().push("a-start");
            sleep(Duration::from_millis(40))?;
            ev.lock().push("a-end");
            Ok(())
        })
        .unwrap();

        // 等 A 先进入执行
        thread::sleep(Duration::from_millis(10));

        let ev = Arc::clone(&events);
        let b = launch_on(&q, move || {
            ev.lock().push("b");
            Ok(())
        })
        .unwrap();

        assert!(a.join().is_ok());
        assert!(b.join().is_ok());

        // B 在 A 挂起后执行，而不是在 A 运行中，也不晚于 A 恢复
        let log = events.lock().clone();
        assert_eq!(log, vec!["a-start", "b", "a-end"]);
    }

    #[test]
    fn test_concurrent_queue_completes() {
        let q = DispatchQueue::concurrent("pool");
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(
                launch_on(&q, move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
                .unwrap(),
            );
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_sleep_duration() {
        let handle = launch(|| {
            let start = Instant::now();
            sleep(Duration::from_millis(30))?;
            assert!(start.elapsed() >= Duration::from_millis(30));
            Ok(())
        })
        .unwrap();

        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_cancel_sleeping_coroutine() {
        let handle = launch(|| {
            loop {
                sleep(Duration::from_millis(5))?;
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        handle.cancel();

        match handle.join() {
            Err(CoError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_before_first_run() {
        let q = DispatchQueue::serial("busy");
        let ran = Arc::new(AtomicBool::new(false));

        // 占住队列，让受害者停在门闸后
        let blocker = launch_on(&q, || {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();

        let flag = Arc::clone(&ran);
        let victim = launch_on(&q, move || {
            flag.store(true, Ordering::Release);
            Ok(())
        })
        .unwrap();

        victim.cancel();

        match victim.join() {
            Err(CoError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
        // 协程体从未执行
        assert!(!ran.load(Ordering::Acquire));
        assert!(blocker.join().is_ok());
    }

    #[test]
    fn test_hop_to_queue() {
        let q = DispatchQueue::serial("target");
        let hopped = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&hopped);
        let target = q.clone();
        let handle = launch(move || {
            hop_to(&target)?;
            flag.store(true, Ordering::Release);
            Ok(())
        })
        .unwrap();

        assert!(handle.join().is_ok());
        assert!(hopped.load(Ordering::Acquire));
    }

    #[test]
    fn test_join_from_coroutine() {
        let outer = launch(|| {
            let inner = launch(|| {
                sleep(Duration::from_millis(10))?;
                Ok(())
            })
            .map_err(CoError::wrap)?;

            // 在协程内等待，挂起而不阻塞工作线程
            inner.join()?;
            Ok(())
        })
        .unwrap();

        assert!(outer.join().is_ok());
    }

    #[test]
    fn test_try_result() {
        let handle = launch(|| {
            sleep(Duration::from_millis(10))?;
            Ok(())
        })
        .unwrap();

        let start = Instant::now();
        loop {
            if let Some(result) = handle.try_result() {
                assert!(result.is_ok());
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "coroutine never finished");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(handle.is_done());
        assert_eq!(handle.status(), crate::CoStatus::Completed);
        // 结果只交付一次
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_yield_now_outside_coroutine() {
        assert!(yield_now().is_ok());
        assert!(current_id().is_none());
        assert!(!is_cancelled());
    }

    #[test]
    fn test_current_id_inside_coroutine() {
        let handle = launch(|| {
            assert!(current_id().is_some());
            Ok(())
        })
        .unwrap();
        let expected = handle.id();
        assert!(expected > 0);
        assert!(handle.join().is_ok());
    }
}
