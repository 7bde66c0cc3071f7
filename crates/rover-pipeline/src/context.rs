//! 运行上下文（取消信号）
//!
//! 同一条流水线的所有步骤共享一个 [`Context`]。取消是自顶向下传播的一次性事件：
//! 调用 [`Context::cancel`] 后，所有阻塞在 `receive` / `send` 上的步骤都会立即返回。
//!
//! # 实现
//!
//! 取消信号通过“关闭通道”实现：上下文内部持有一个从不发送数据的
//! `Sender<()>`，取消时将其释放，所有 `done()` 接收端随即变为 disconnected，
//! 可以直接放进 `crossbeam_channel::select!` 中与数据队列一起等待，无需轮询。
//!
//! ```
//! use rover_pipeline::Context;
//! use std::time::Duration;
//!
//! let ctx = Context::new();
//! let child = ctx.with_timeout(Duration::from_secs(60));
//!
//! ctx.cancel();
//! assert!(child.done().recv_timeout(Duration::from_secs(1)).is_err());
//! assert!(child.is_cancelled());
//! ```

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::trace;

struct Inner {
    /// 取消标志
    cancelled: Arc<AtomicBool>,
    /// 取消触发器（释放即广播取消）
    trigger: Mutex<Option<Sender<()>>>,
    /// 取消通知接收端
    done: Receiver<()>,
}

impl Inner {
    fn cancel(&self) {
        // Release: 看到 true 的线程必须能看到取消前的所有写入
        self.cancelled.store(true, Ordering::Release);
        let trigger = self.trigger.lock().take();
        drop(trigger);
    }
}

/// 共享取消上下文
///
/// 可廉价克隆；所有克隆共享同一个取消状态。
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// 创建新的根上下文
    pub fn new() -> Self {
        let (trigger, done) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: Arc::new(AtomicBool::new(false)),
                trigger: Mutex::new(Some(trigger)),
                done,
            }),
        }
    }

    /// 取消上下文（幂等）
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// 是否已取消
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// 取消通知通道
    ///
    /// 该通道从不传递数据；取消后 `recv()` 立即返回 `Err`。
    /// 用于 `select!` 中与数据队列一起等待。
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// 阻塞直到上下文被取消
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// 阻塞直到取消或超时，返回是否已取消
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let _ = self.inner.done.recv_timeout(timeout);
        self.is_cancelled()
    }

    /// 派生子上下文
    ///
    /// 父上下文取消时子上下文随之取消；取消子上下文不影响父上下文。
    pub fn child(&self) -> Context {
        self.derive(None)
    }

    /// 派生带截止时间的子上下文
    ///
    /// 超过 `timeout` 后子上下文自动取消。流水线核心本身不施加任何超时，
    /// 需要墙钟预算的调用方用此方法包装 `run()`。
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.derive(Some(timeout))
    }

    fn derive(&self, timeout: Option<Duration>) -> Context {
        let child = Context::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }

        let parent_done = self.inner.done.clone();
        let parent_flag = self.inner.cancelled.clone();
        let child_done = child.inner.done.clone();
        let child_weak = Arc::downgrade(&child.inner);

        thread::spawn(move || watch(parent_done, parent_flag, child_done, child_weak, timeout));

        child
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 子上下文监视线程
///
/// 退出条件：父上下文取消、截止时间到达、子上下文被取消或全部释放。
fn watch(
    parent_done: Receiver<()>,
    parent_flag: Arc<AtomicBool>,
    child_done: Receiver<()>,
    child: Weak<Inner>,
    timeout: Option<Duration>,
) {
    let deadline = match timeout {
        Some(d) => crossbeam_channel::after(d),
        None => never(),
    };
    let mut parent_alive = true;

    loop {
        // 父上下文被释放（trigger 随之释放）时 done 同样会断开，需要用标志区分
        let parent = if parent_alive {
            parent_done.clone()
        } else {
            never()
        };

        select! {
            recv(parent) -> _ => {
                if parent_flag.load(Ordering::Acquire) {
                    if let Some(inner) = child.upgrade() {
                        inner.cancel();
                    }
                    break;
                }
                // 父上下文被释放但未取消：只继续等待截止时间和子上下文
                parent_alive = false;
            },
            recv(deadline) -> _ => {
                if let Some(inner) = child.upgrade() {
                    trace!("Context deadline reached, cancelling");
                    inner.cancel();
                }
                break;
            },
            recv(child_done) -> _ => break,
        }
    }
}
