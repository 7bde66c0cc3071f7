//! 模拟传感器源
//!
//! 按固定频率产生带抖动时间戳的 [`Frame`]，用于在没有真实设备时驱动流水线。
//! 所有传感器共享同一个时间原点（进程启动时刻），因此时间戳之间可以直接比较。

use rand::Rng;
use rover_pipeline::{
    Context, PipelineError, QueueReceiver, QueueSender, Step, StepConfig, StepMetrics, make_queue,
    send,
};
use rover_record::Frame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 传感器名字段
pub const FIELD_SENSOR: &str = "sensor";

/// 模拟传感器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    /// 输出频率（Hz）
    pub rate_hz: f64,
    /// 时间戳抖动上限（纳秒，均匀分布 ±jitter_ns）
    pub jitter_ns: i64,
    /// 时钟偏移（纳秒）
    pub offset_ns: i64,
    /// 丢帧概率（0.0 ~ 1.0，丢帧表现为序号间隙）
    pub drop_probability: f64,
    /// 产生的记录总数（None = 直到取消）
    pub count: Option<u64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            step: StepConfig::default(),
            rate_hz: 30.0,
            jitter_ns: 0,
            offset_ns: 0,
            drop_probability: 0.0,
            count: None,
        }
    }
}

impl SensorConfig {
    fn validate(&self) -> Result<(), PipelineError> {
        self.step.validate()?;
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "sensor '{}': rate_hz must be positive, got {}",
                self.step.name, self.rate_hz
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(PipelineError::InvalidConfig(format!(
                "sensor '{}': drop_probability must be within [0, 1], got {}",
                self.step.name, self.drop_probability
            )));
        }
        if self.jitter_ns < 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "sensor '{}': jitter_ns must not be negative",
                self.step.name
            )));
        }
        Ok(())
    }
}

/// 模拟传感器步骤（没有上游）
pub struct SensorSource {
    config: SensorConfig,
    epoch: Instant,
    tx: Option<QueueSender<Frame>>,
    rx: Option<QueueReceiver<Frame>>,
    metrics: Arc<StepMetrics>,
}

impl SensorSource {
    /// 创建新的模拟传感器，时间戳相对 `epoch` 计算
    pub fn new(config: SensorConfig, epoch: Instant) -> Self {
        Self {
            config,
            epoch,
            tx: None,
            rx: None,
            metrics: Arc::new(StepMetrics::new()),
        }
    }

    fn timestamp(&self, rng: &mut impl Rng) -> i64 {
        let jitter = if self.config.jitter_ns > 0 {
            rng.gen_range(-self.config.jitter_ns..=self.config.jitter_ns)
        } else {
            0
        };
        self.epoch.elapsed().as_nanos() as i64 + self.config.offset_ns + jitter
    }
}

impl Step<Frame> for SensorSource {
    fn name(&self) -> &str {
        &self.config.step.name
    }

    fn kind(&self) -> &'static str {
        "sensor"
    }

    fn connect(&mut self, _input: QueueReceiver<Frame>) -> Result<(), PipelineError> {
        Err(PipelineError::InvalidConfig(format!(
            "sensor '{}' is a source and accepts no upstream",
            self.config.step.name
        )))
    }

    fn disconnect(&mut self) {}

    fn output(&self) -> Option<QueueReceiver<Frame>> {
        self.rx.clone()
    }

    fn run(&mut self, ctx: &Context) {
        let name = self.config.step.name.clone();
        let Some(tx) = self.tx.take() else {
            warn!("{}: run() called without reset(), skipping", name);
            return;
        };

        let period = Duration::from_secs_f64(1.0 / self.config.rate_hz);
        let mut rng = rand::thread_rng();
        let mut next = Instant::now();
        let mut last_ts = i64::MIN;
        let mut index: i64 = 0;

        loop {
            if let Some(count) = self.config.count {
                if index as u64 >= count {
                    debug!("{}: produced {} records", name, count);
                    break;
                }
            }

            next += period;
            if ctx.wait_timeout(next.saturating_duration_since(Instant::now())) {
                break;
            }

            let current = index;
            index += 1;
            if self.config.drop_probability > 0.0 && rng.gen_bool(self.config.drop_probability) {
                continue;
            }

            // 抖动不能破坏单调性
            let ts = self.timestamp(&mut rng).max(last_ts);
            last_ts = ts;
            let frame = Frame::new(current, ts).with_field(FIELD_SENSOR, name.as_str());

            match send(ctx, &tx, frame, self.config.step.send_policy) {
                Ok(()) => {
                    self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                },
                Err(PipelineError::Drop) => {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                },
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    warn!("{}: send failed: {}", name, e);
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                },
            }
        }

        drop(tx);
        debug!("{}: output closed", name);
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        self.config.validate()?;
        let (tx, rx) = make_queue(self.config.step.capacity)?;
        self.tx = Some(tx);
        self.rx = Some(rx);
        self.metrics.reset();
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}
