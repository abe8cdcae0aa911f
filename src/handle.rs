//! 协程句柄
//!
//! 启动协程后返回的观察点。句柄可以直接丢弃（fire-and-forget），
//! 丢弃不泄漏栈；未被观察的失败会记录日志而不是静默消失。

use std::sync::Arc;

use crate::coroutine::{self, CoError, CoStatus, Coroutine, SwitchIntent};
use crate::scheduler::get_scheduler;
use crate::CoId;

/// 协程句柄
///
/// 结果只交付一次：`join` 或 `try_result` 取走后不再出现。
pub struct JoinHandle {
    co: Arc<Coroutine>,
}

impl JoinHandle {
    pub(crate) fn new(co: Arc<Coroutine>) -> Self {
        Self { co }
    }

    /// 获取协程 ID
    pub fn id(&self) -> CoId {
        self.co.id()
    }

    /// 获取协程状态
    pub fn status(&self) -> CoStatus {
        self.co.status()
    }

    /// 检查是否已结束
    pub fn is_done(&self) -> bool {
        self.co.is_terminal()
    }

    /// 请求取消
    ///
    /// 协作式：设置取消标记并唤醒协程，协程在下一个挂起点
    /// 观察到取消。不会从任意位置强行展开。
    pub fn cancel(&self) {
        self.co.request_cancel();
        get_scheduler().unpark_co(&self.co);
    }

    /// 非阻塞地取走结果
    ///
    /// 协程尚未结束、或结果已被取走时返回 None。
    pub fn try_result(&self) -> Option<Result<(), CoError>> {
        if !self.co.is_terminal() {
            return None;
        }
        self.co.take_result()
    }

    /// 等待协程结束并取走结果
    ///
    /// 在协程内调用时挂起当前协程，不占用工作线程；
    /// 在普通线程上调用时阻塞等待。
    pub fn join(self) -> Result<(), CoError> {
        match coroutine::current() {
            Some(me) => {
                if Arc::ptr_eq(&me, &self.co) {
                    return Err(CoError::msg("coroutine cannot join itself"));
                }
                while !self.co.is_terminal() {
                    // 注册后再挂起；注册失败说明目标刚刚结束
                    if !self.co.push_waiter(Arc::clone(&me)) {
                        break;
                    }
                    coroutine::suspend_current(&me, SwitchIntent::Park);
                }
            }
            None => self.co.wait_done(),
        }

        match self.co.take_result() {
            Some(result) => result,
            // 结果已被 try_result 取走
            None => Ok(()),
        }
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        self.co.detach();
    }
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
