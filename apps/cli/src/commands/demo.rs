//! demo 命令
//!
//! 多个频率、时钟偏移各不相同的模拟传感器 → Aligner（以第一个传感器为参考）→ 频率统计。
//! 结束时打印每个来源相对参考记录的平均时间差。

use anyhow::{Result, bail};
use clap::Args;
use rover_pipeline::rate::DEFAULT_RATE_WINDOW;
use rover_pipeline::{
    Aligner, AlignerConfig, Context, Pipeline, RateMeter, ReferenceMode, StepConfig, StepId,
    Transform, align_delta_field,
};
use rover_record::{FIELD_RATE, Frame, Record, Value};
use std::thread;
use std::time::{Duration, Instant};

use crate::sensor::{SensorConfig, SensorSource};
use crate::utils::{drain, install_ctrlc, print_metrics};

/// 对齐演示命令参数
#[derive(Args, Debug)]
pub struct DemoCommand {
    /// 传感器数量
    #[arg(short, long, default_value_t = 3)]
    pub sources: usize,

    /// 参考传感器频率（Hz），其余传感器依次加快 50%
    #[arg(short, long, default_value_t = 30.0)]
    pub rate_hz: f64,

    /// 运行时长（秒）
    #[arg(short, long, default_value_t = 5)]
    pub duration_secs: u64,

    /// 时间戳抖动上限（纳秒）
    #[arg(long, default_value_t = 2_000_000)]
    pub jitter_ns: i64,
}

/// 对齐输出统计
#[derive(Debug, Clone)]
pub struct AlignStats {
    /// 对齐输出记录数
    pub records: u64,
    /// 每个来源的 |Δt| 累计值（纳秒）
    delta_sum: Vec<u128>,
    delta_count: Vec<u64>,
    /// 最近一次测得的输出频率（Hz）
    pub last_rate: Option<f64>,
}

impl AlignStats {
    pub fn new(sources: usize) -> Self {
        Self {
            records: 0,
            delta_sum: vec![0; sources],
            delta_count: vec![0; sources],
            last_rate: None,
        }
    }

    pub fn observe(&mut self, frame: &Frame) {
        self.records += 1;
        for j in 0..self.delta_sum.len() {
            if let Some(delta) = frame.field(&align_delta_field(j)).and_then(Value::as_int) {
                self.delta_sum[j] += delta.unsigned_abs() as u128;
                self.delta_count[j] += 1;
            }
        }
        if let Some(rate) = frame.field(FIELD_RATE).and_then(Value::as_float) {
            self.last_rate = Some(rate);
        }
    }

    /// 来源 `j` 的平均 |Δt|（毫秒）
    pub fn mean_delta_ms(&self, j: usize) -> Option<f64> {
        let count = *self.delta_count.get(j)?;
        if count == 0 {
            return None;
        }
        Some(self.delta_sum[j] as f64 / count as f64 / 1_000_000.0)
    }
}

impl DemoCommand {
    /// 执行命令
    pub fn execute(&self) -> Result<()> {
        println!(
            "🛰  对齐演示: {} 个传感器, 参考频率 {} Hz, 运行 {} 秒",
            self.sources, self.rate_hz, self.duration_secs
        );

        let (mut pipeline, output) = self.build(Instant::now())?;

        let root = Context::new();
        install_ctrlc(&root)?;
        let ctx = root.with_timeout(Duration::from_secs(self.duration_secs));
        let stats = self.run(&mut pipeline, output, &ctx)?;

        println!();
        println!("📊 步骤指标:");
        print_metrics(&pipeline.metrics());
        println!();
        println!("📐 对齐结果: {} 条记录", stats.records);
        if let Some(rate) = stats.last_rate {
            println!("  输出频率: {:.1} Hz", rate);
        }
        for j in 0..self.sources {
            match stats.mean_delta_ms(j) {
                Some(ms) => println!("  sensor{}: 平均 |Δt| = {:.3} ms", j, ms),
                None => println!("  sensor{}: 无数据", j),
            }
        }
        Ok(())
    }

    /// 构建并 reset 演示流水线，返回终端步骤
    pub fn build(&self, epoch: Instant) -> Result<(Pipeline<Frame>, StepId)> {
        if self.sources == 0 {
            bail!("demo needs at least one sensor");
        }

        let mut pipeline = Pipeline::new();
        let mut sensors = Vec::with_capacity(self.sources);
        for i in 0..self.sources {
            let config = SensorConfig {
                step: StepConfig::named(format!("sensor{}", i)),
                rate_hz: self.rate_hz * (1.0 + 0.5 * i as f64),
                jitter_ns: self.jitter_ns,
                offset_ns: i as i64 * 1_000_000,
                ..SensorConfig::default()
            };
            sensors.push(pipeline.add_step(SensorSource::new(config, epoch))?);
        }

        let align = pipeline.add_step(Aligner::<Frame>::new(AlignerConfig {
            step: StepConfig::named("align"),
            reference: ReferenceMode::Source(0),
            ..AlignerConfig::default()
        }))?;
        // 连接顺序即来源序号
        for &sensor in sensors.iter() {
            pipeline.connect_steps(sensor, align)?;
        }

        let rate = pipeline.add_step(
            Transform::<Frame>::new(StepConfig::named("rate"), RateMeter::new(DEFAULT_RATE_WINDOW))
                .with_kind("rate"),
        )?;
        pipeline.connect_steps(align, rate)?;

        pipeline.reset()?;
        Ok((pipeline, rate))
    }

    /// 运行流水线并统计 `output` 步骤的输出，直到 `ctx` 取消
    pub fn run(
        &self,
        pipeline: &mut Pipeline<Frame>,
        output: StepId,
        ctx: &Context,
    ) -> Result<AlignStats> {
        let Some(rx) = pipeline.output(output) else {
            bail!("step {} has no output", output);
        };
        let sources = self.sources;
        thread::scope(|s| -> Result<AlignStats> {
            let consumer = s.spawn(move || {
                let mut stats = AlignStats::new(sources);
                drain(rx, |frame| stats.observe(frame));
                stats
            });
            pipeline.run(ctx)?;
            match consumer.join() {
                Ok(stats) => Ok(stats),
                Err(_) => bail!("consumer thread panicked"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo(sources: usize) -> DemoCommand {
        DemoCommand {
            sources,
            rate_hz: 100.0,
            duration_secs: 1,
            jitter_ns: 500_000,
        }
    }

    #[test]
    fn test_stats_mean_delta() {
        let mut stats = AlignStats::new(2);
        stats.observe(
            &Frame::new(0, 100)
                .with_field(&align_delta_field(0), 0i64)
                .with_field(&align_delta_field(1), -2_000_000i64),
        );
        stats.observe(
            &Frame::new(1, 200)
                .with_field(&align_delta_field(0), 0i64)
                .with_field(&align_delta_field(1), 4_000_000i64)
                .with_field(FIELD_RATE, 25.0),
        );

        assert_eq!(stats.records, 2);
        assert_eq!(stats.mean_delta_ms(0), Some(0.0));
        assert_eq!(stats.mean_delta_ms(1), Some(3.0));
        assert_eq!(stats.mean_delta_ms(2), None);
        assert_eq!(stats.last_rate, Some(25.0));
    }

    #[test]
    fn test_build_rejects_zero_sources() {
        assert!(demo(0).build(Instant::now()).is_err());
    }

    #[test]
    fn test_build_topology() {
        let (pipeline, output) = demo(3).build(Instant::now()).unwrap();
        assert_eq!(pipeline.len(), 5);
        assert_eq!(pipeline.get_step(output).unwrap().kind(), "rate");
        assert_eq!(pipeline.unconnected_outputs(), vec![(output, 0)]);
    }

    #[test]
    fn test_demo_aligns_all_sources() {
        let cmd = demo(2);
        let (mut pipeline, output) = cmd.build(Instant::now()).unwrap();
        let ctx = Context::new().with_timeout(Duration::from_millis(500));
        let stats = cmd.run(&mut pipeline, output, &ctx).unwrap();

        assert!(stats.records > 0);
        assert_eq!(stats.mean_delta_ms(0), Some(0.0));
        // sensor1 的周期约 6.7ms，最近匹配的时间差不会超过一个周期加抖动
        let mean = stats.mean_delta_ms(1).unwrap();
        assert!(mean < 10.0, "mean delta {} ms", mean);
    }
}
