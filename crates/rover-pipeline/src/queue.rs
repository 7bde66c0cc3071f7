//! 队列协议
//!
//! 所有步骤共享的读写规则：
//!
//! - [`make_queue`]: 创建有界队列（容量必须 > 0）
//! - [`receive`]: 阻塞读取，直到有数据、队列关闭（`EndOfStream`）或上下文取消（`Cancelled`）
//! - [`send`]: 按 [`SendPolicy`] 写入：阻塞策略等待空位，丢弃策略满时返回 `Drop`
//!
//! 队列底层是 `crossbeam_channel` 有界通道：多生产者安全（Merge 的多个排空线程共享同一个
//! 输出 sender 克隆），单个生产者内 FIFO。关闭队列 = 释放所有 sender 克隆；读端先读完缓冲数据，
//! 之后才观察到 `EndOfStream`。

use crate::context::Context;
use crate::error::PipelineError;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use serde::{Deserialize, Serialize};

/// 队列写端
pub type QueueSender<R> = Sender<R>;

/// 队列读端（可克隆；多个读端竞争消费同一队列）
pub type QueueReceiver<R> = Receiver<R>;

/// 发送策略
///
/// | 策略 | 队列满时 | 适用场景 |
/// |------|---------|---------|
/// | Blocking | 阻塞等待空位或取消 | 不允许丢数据的链路（背压） |
/// | Drop | 立即返回 `PipelineError::Drop` | 实时链路，慢消费者不拖累生产者 |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicy {
    #[default]
    Blocking,
    Drop,
}

/// 创建有界队列
///
/// # 错误
///
/// - `InvalidConfig`: `capacity == 0`（零容量通道是 rendezvous 语义，会导致丢弃策略永远丢帧）
pub fn make_queue<R>(capacity: usize) -> Result<(QueueSender<R>, QueueReceiver<R>), PipelineError> {
    if capacity == 0 {
        return Err(PipelineError::InvalidConfig(
            "queue capacity must be greater than 0".to_string(),
        ));
    }
    Ok(bounded(capacity))
}

/// 从队列读取一条记录
///
/// 阻塞直到：
/// - 有数据可读 → `Ok(record)`
/// - 队列已关闭且读空 → `Err(EndOfStream)`
/// - 上下文取消 → `Err(Cancelled)`
///
/// 不进行忙等待；取消信号与数据一起在 `select!` 中等待。
pub fn receive<R>(ctx: &Context, queue: &QueueReceiver<R>) -> Result<R, PipelineError> {
    if ctx.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    select! {
        recv(queue) -> msg => msg.map_err(|_| PipelineError::EndOfStream),
        recv(ctx.done()) -> _ => Err(PipelineError::Cancelled),
    }
}

/// 向队列写入一条记录
///
/// # 策略
///
/// - `Blocking`: 阻塞直到有空位，或上下文取消（`Err(Cancelled)`）
/// - `Drop`: 非阻塞尝试，队列满时返回 `Err(Drop)`，记录被丢弃
///
/// 两种策略都不会在上下文取消后继续阻塞。
pub fn send<R>(
    ctx: &Context,
    queue: &QueueSender<R>,
    record: R,
    policy: SendPolicy,
) -> Result<(), PipelineError> {
    if ctx.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    match policy {
        SendPolicy::Blocking => select! {
            send(queue, record) -> res => res.map_err(|_| PipelineError::Disconnected),
            recv(ctx.done()) -> _ => Err(PipelineError::Cancelled),
        },
        SendPolicy::Drop => match queue.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::Drop),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::Disconnected),
        },
    }
}
