//! Step 契约
//!
//! 流水线中的每个阶段（Merge / Split / Transform / Sink / Aligner / 用户自定义）都实现 [`Step`]。
//!
//! # 生命周期
//!
//! ```text
//! new(config) ──► connect(upstream)* ──► reset() ──► run(ctx) ──► [输出队列关闭]
//!                                           ▲                         │
//!                                           └─────────────────────────┘
//! ```
//!
//! - `reset()` 重新分配输出队列并清空运行期状态（不影响已连接的上游）
//! - `run()` 阻塞当前线程，直到所有上游耗尽或上下文取消；返回前输出队列恰好关闭一次
//! - 步骤之间不传递错误：跨步骤的唯一信号是队列的关闭/读空状态

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::{QueueReceiver, QueueSender, SendPolicy, make_queue, send};
use rover_record::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 默认输出队列容量
pub const DEFAULT_CAPACITY: usize = 16;

/// 步骤通用配置
///
/// 所有字段都有默认值；配置文件中未识别的键会被忽略。
///
/// # Example
///
/// ```
/// use rover_pipeline::{SendPolicy, StepConfig};
///
/// let config = StepConfig::named("camera_sync")
///     .with_capacity(4)
///     .with_send_policy(SendPolicy::Drop);
///
/// assert_eq!(config.capacity, 4);
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// 步骤名称（流水线内唯一）
    pub name: String,
    /// 输出队列容量（必须 > 0）
    pub capacity: usize,
    /// 输出发送策略
    pub send_policy: SendPolicy,
    /// 是否启用（禁用时 Transform/Sink 跳过用户函数，数据直通）
    pub enabled: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capacity: DEFAULT_CAPACITY,
            send_policy: SendPolicy::Blocking,
            enabled: true,
        }
    }
}

impl StepConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_send_policy(mut self, policy: SendPolicy) -> Self {
        self.send_policy = policy;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 校验配置（在 `reset()` 中调用）
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.capacity == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': capacity must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// 流水线步骤契约
///
/// 新的步骤类型由用户以插件方式添加，因此这里使用开放的 trait 而非封闭的枚举。
/// 流水线以 `Box<dyn Step<R>>` 持有步骤，每个步骤在独立线程中运行。
pub trait Step<R: Record>: Send {
    /// 步骤名称
    fn name(&self) -> &str;

    /// 步骤类型（注册表中的类型名）
    fn kind(&self) -> &'static str;

    /// 连接上游队列（In）
    ///
    /// 单输入步骤只接受一次调用，之后返回 `AlreadyConnected`；
    /// Merge 和 Aligner 每次调用追加一个输入。
    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError>;

    /// 断开所有上游（流水线重新连线时使用）
    fn disconnect(&mut self);

    /// 下游队列读端（Out）
    ///
    /// 仅在 `reset()` 之后有效，之前返回 `None`。
    fn output(&self) -> Option<QueueReceiver<R>>;

    /// 输出端口数量（Split 为 N，其他步骤为 1）
    fn output_count(&self) -> usize {
        1
    }

    /// 指定端口的下游队列读端
    fn output_at(&self, port: usize) -> Option<QueueReceiver<R>> {
        if port == 0 { self.output() } else { None }
    }

    /// 运行步骤（阻塞）
    ///
    /// 直到 (a) 所有上游耗尽，或 (b) `ctx` 取消。两种情况下输出队列都在返回前关闭。
    fn run(&mut self, ctx: &Context);

    /// 重置步骤：重新分配输出队列，清空运行期状态
    ///
    /// 配置无效（容量为 0 等）时立即失败，而不是在运行期死锁。
    fn reset(&mut self) -> Result<(), PipelineError>;

    /// 步骤指标
    fn metrics(&self) -> Arc<StepMetrics>;
}

/// 单个输出队列的生命周期管理
///
/// `reset()` 分配新队列；`run()` 通过 `take_sender()` 取走写端，
/// 写端在 `run()` 结束时释放，从而保证输出恰好关闭一次。
pub(crate) struct Output<R> {
    capacity: usize,
    tx: Option<QueueSender<R>>,
    rx: Option<QueueReceiver<R>>,
}

impl<R> Output<R> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tx: None,
            rx: None,
        }
    }

    pub(crate) fn reset(&mut self) -> Result<(), PipelineError> {
        let (tx, rx) = make_queue(self.capacity)?;
        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    /// 取走写端；未 reset 或已运行过时返回 `None`
    pub(crate) fn take_sender(&mut self) -> Option<QueueSender<R>> {
        self.tx.take()
    }

    pub(crate) fn receiver(&self) -> Option<QueueReceiver<R>> {
        self.rx.clone()
    }
}

/// 单输入槽
pub(crate) struct Input<R> {
    rx: Option<QueueReceiver<R>>,
}

impl<R> Input<R> {
    pub(crate) fn new() -> Self {
        Self { rx: None }
    }

    pub(crate) fn connect(&mut self, step: &str, rx: QueueReceiver<R>) -> Result<(), PipelineError> {
        if self.rx.is_some() {
            return Err(PipelineError::AlreadyConnected {
                step: step.to_string(),
            });
        }
        self.rx = Some(rx);
        Ok(())
    }

    pub(crate) fn disconnect(&mut self) {
        self.rx = None;
    }

    pub(crate) fn get(&self) -> Option<&QueueReceiver<R>> {
        self.rx.as_ref()
    }
}

/// 发送后的流程控制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// 写入下游并更新指标
///
/// - `Drop` 可恢复：记录 debug 日志，继续
/// - `Cancelled` / `Disconnected`：停止当前读取循环
pub(crate) fn forward<R>(
    ctx: &Context,
    tx: &QueueSender<R>,
    record: R,
    policy: SendPolicy,
    metrics: &StepMetrics,
    step: &str,
) -> Flow {
    match send(ctx, tx, record, policy) {
        Ok(()) => {
            metrics.inc_sent();
            Flow::Continue
        },
        Err(PipelineError::Drop) => {
            metrics.inc_dropped();
            debug!("{}: downstream queue full, record dropped", step);
            Flow::Continue
        },
        Err(PipelineError::Cancelled) => Flow::Stop,
        Err(e) => {
            warn!("{}: send failed: {}", step, e);
            metrics.inc_errors();
            Flow::Stop
        },
    }
}

/// 处理非 EOS / 非取消的读取错误
pub(crate) fn log_receive_error(step: &str, e: &PipelineError, metrics: &StepMetrics) {
    match e {
        PipelineError::EndOfStream => debug!("{}: upstream exhausted", step),
        PipelineError::Cancelled => debug!("{}: cancelled", step),
        other => {
            metrics.inc_errors();
            tracing::error!("{}: receive failed, closing input: {}", step, other);
        },
    }
}
