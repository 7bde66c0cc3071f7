//! 速率统计处理器
//!
//! 基于生产者时间戳的滑动窗口统计记录速率（records/s），并根据序号间隙累计丢帧数。
//! 结果通过 [`Record::set_rate`] / [`Record::set_dropped`] 写回每条记录。
//!
//! 与墙钟无关：离线回放的数据也能得到与采集时一致的速率。

use crate::step::StepConfig;
use crate::transform::Processor;
use rover_record::Record;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 默认滑动窗口长度（记录数）
pub const DEFAULT_RATE_WINDOW: usize = 32;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// 速率统计配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    /// 滑动窗口长度（至少 2）
    pub window: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            step: StepConfig::default(),
            window: DEFAULT_RATE_WINDOW,
        }
    }
}

/// 速率统计处理器
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: usize,
    timestamps: VecDeque<i64>,
    last_index: Option<i64>,
    dropped: u64,
}

impl RateMeter {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            timestamps: VecDeque::with_capacity(window.min(DEFAULT_RATE_WINDOW)),
            last_index: None,
            dropped: 0,
        }
    }

    /// 当前窗口内的速率（records/s）
    ///
    /// 窗口内少于两条记录或时间跨度为 0 时返回 0.0。
    pub fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.timestamps.front(), self.timestamps.back()) else {
            return 0.0;
        };
        let span = last.saturating_sub(*first);
        if span <= 0 {
            return 0.0;
        }
        (self.timestamps.len() - 1) as f64 * NANOS_PER_SEC / span as f64
    }

    /// 累计丢帧数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// 记录一次观测
    pub fn observe(&mut self, index: i64, timestamp: i64) {
        if let Some(last) = self.last_index {
            // i128 容纳任意两个 i64 之差
            let gap = i128::from(index) - i128::from(last) - 1;
            if gap > 0 {
                let gap = u64::try_from(gap).unwrap_or(u64::MAX);
                self.dropped = self.dropped.saturating_add(gap);
            }
        }
        self.last_index = Some(index);

        self.timestamps.push_back(timestamp);
        while self.timestamps.len() > self.window {
            self.timestamps.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.last_index = None;
        self.dropped = 0;
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl<R: Record> Processor<R> for RateMeter {
    fn reset(&mut self) {
        self.clear();
    }

    fn process(&mut self, src: &R, dst: &mut R) -> anyhow::Result<()> {
        self.observe(src.index(), src.timestamp());
        dst.set_rate(self.rate());
        dst.set_dropped(self.dropped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_record::{FIELD_DROPPED, FIELD_RATE, Frame, Value};

    #[test]
    fn test_rate_from_timestamps() {
        let mut meter = RateMeter::new(8);
        // 100Hz
        for i in 0..8 {
            meter.observe(i, i * 10_000_000);
        }
        assert!((meter.rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_window_slides() {
        let mut meter = RateMeter::new(4);
        for i in 0..4 {
            meter.observe(i, i * 10_000_000);
        }
        // 频率降到 10Hz
        for i in 4..8 {
            meter.observe(i, 30_000_000 + (i - 3) * 100_000_000);
        }
        assert!((meter.rate() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_degenerate_window() {
        let mut meter = RateMeter::default();
        assert_eq!(meter.rate(), 0.0);
        meter.observe(0, 5);
        assert_eq!(meter.rate(), 0.0);
        meter.observe(1, 5);
        assert_eq!(meter.rate(), 0.0);
    }

    #[test]
    fn test_index_gaps_are_counted() {
        let mut meter = RateMeter::default();
        for index in [0, 1, 4, 5, 9] {
            meter.observe(index, index);
        }
        assert_eq!(meter.dropped(), 5);

        meter.clear();
        assert_eq!(meter.dropped(), 0);
    }

    #[test]
    fn test_extreme_index_gap_saturates() {
        let mut meter = RateMeter::default();
        meter.observe(-1, 0);
        meter.observe(i64::MAX, 1);
        assert_eq!(meter.dropped(), i64::MAX as u64);

        meter.observe(i64::MIN, 2);
        meter.observe(i64::MAX, 3);
        assert_eq!(meter.dropped(), u64::MAX);
    }

    #[test]
    fn test_huge_window_is_not_preallocated() {
        let mut meter = RateMeter::new(usize::MAX);
        for i in 0..4 {
            meter.observe(i, i * 10_000_000);
        }
        assert!((meter.rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_processor_stamps_fields() {
        let mut meter = RateMeter::new(4);
        let mut last = Frame::default();
        for i in [0i64, 1, 3] {
            let src = Frame::new(i, i * 1_000_000_000);
            let mut dst = src.clone();
            Processor::<Frame>::process(&mut meter, &src, &mut dst).unwrap();
            last = dst;
        }
        assert_eq!(last.field(FIELD_DROPPED), Some(&Value::Int(1)));
        assert_eq!(last.field(FIELD_RATE), Some(&Value::Float(2.0 / 3.0)));
    }

    #[test]
    fn test_rate_config_defaults() {
        let config: RateConfig = serde_json::from_str(r#"{"name": "fps"}"#).unwrap();
        assert_eq!(config.window, DEFAULT_RATE_WINDOW);
        assert_eq!(config.step.name, "fps");
    }
}
