//! 步骤性能指标模块
//!
//! 提供零开销的原子计数器，用于监控每个步骤的吞吐和丢弃情况。
//! 所有计数器都使用原子操作，可以在任何线程安全地读取，不会引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 步骤实时指标
///
/// 步骤在自己的运行线程中更新计数器，其他线程通过 `Arc<StepMetrics>` 读取快照。
///
/// # 使用示例
///
/// ```rust
/// use rover_pipeline::StepMetrics;
/// use std::sync::Arc;
/// use std::sync::atomic::Ordering;
///
/// let metrics = Arc::new(StepMetrics::default());
///
/// // 在步骤线程中更新指标
/// metrics.received.fetch_add(1, Ordering::Relaxed);
///
/// // 在主线程中读取快照
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.received, 1);
/// ```
#[derive(Debug, Default)]
pub struct StepMetrics {
    /// 从上游读取的记录数
    pub received: AtomicU64,

    /// 成功写入下游的记录数
    pub sent: AtomicU64,

    /// 丢弃策略下因队列满丢弃的记录数
    ///
    /// 如果这个值快速增长，说明下游消费速度跟不上。
    pub dropped: AtomicU64,

    /// 处理错误次数（处理函数失败、非 EOS 的读取错误等）
    pub errors: AtomicU64,
}

impl StepMetrics {
    /// 创建新的指标实例（所有计数器初始化为 0）
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    ///
    /// 使用 `Ordering::Relaxed`，不同计数器之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.sent.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub(crate) fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// 指标快照（不可变，用于读取）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    /// 计算丢弃率（百分比）
    ///
    /// 分母为尝试写入下游的次数（`sent + dropped`），为 0 时返回 0.0。
    pub fn drop_rate(&self) -> f64 {
        let attempted = self.sent + self.dropped;
        if attempted == 0 {
            return 0.0;
        }
        (self.dropped as f64 / attempted as f64) * 100.0
    }
}
