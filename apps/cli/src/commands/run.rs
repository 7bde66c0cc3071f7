//! run 命令
//!
//! 加载流水线描述文件并运行，直到 Ctrl-C、截止时间或所有数据源结束。

use anyhow::{Context as _, Result, anyhow};
use clap::Args;
use rover_pipeline::{Context, Pipeline, PipelineSpec, Registry, Step, StepConfig};
use rover_record::Frame;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::sensor::{SensorConfig, SensorSource};
use crate::utils::{drain, install_ctrlc, print_metrics};

/// 流水线运行命令参数
#[derive(Args, Debug)]
pub struct RunCommand {
    /// 流水线描述文件（.toml / .json）
    #[arg(short, long)]
    pub config: PathBuf,

    /// 运行时长（秒，省略则运行到 Ctrl-C）
    #[arg(short, long)]
    pub duration_secs: Option<u64>,

    /// 外部输入的模拟传感器频率（Hz）
    #[arg(long, default_value_t = 30.0)]
    pub rate_hz: f64,
}

/// 内置步骤类型加上 `sensor` 数据源
pub fn registry(epoch: Instant) -> Registry<Frame> {
    let mut registry = Registry::with_builtins();
    registry.register("sensor", move |spec| {
        let config: SensorConfig = spec.options()?;
        Ok(Box::new(SensorSource::new(config, epoch)))
    });
    registry
}

/// 终端输出的消费结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// `(步骤[端口], 记录数)`
    pub outputs: Vec<(String, u64)>,
}

impl RunCommand {
    /// 执行命令
    pub fn execute(&self) -> Result<()> {
        println!("📜 加载流水线: {}", self.config.display());

        let epoch = Instant::now();
        let (mut pipeline, mut sensors) = self.build(epoch)?;
        println!(
            "📋 {} 个步骤, {} 个外部输入",
            pipeline.len(),
            sensors.len()
        );

        let root = Context::new();
        install_ctrlc(&root)?;
        let ctx = match self.duration_secs {
            Some(secs) => root.with_timeout(Duration::from_secs(secs)),
            None => root.child(),
        };

        let start = Instant::now();
        let summary = run_pipeline(&mut pipeline, &mut sensors, &ctx)?;

        println!();
        println!("📊 运行结果 ({:.2} 秒):", start.elapsed().as_secs_f64());
        let mut rows = pipeline.metrics();
        rows.extend(
            sensors
                .iter()
                .map(|s| (s.name().to_string(), s.metrics().snapshot())),
        );
        print_metrics(&rows);
        if !summary.outputs.is_empty() {
            println!();
            println!("📤 终端输出:");
            for (label, count) in summary.outputs.iter() {
                println!("  {}: {} 条记录", label, count);
            }
        }

        Ok(())
    }

    /// 加载描述文件，构建流水线并为每个外部输入创建模拟传感器
    ///
    /// 返回的流水线已经 reset。
    pub fn build(&self, epoch: Instant) -> Result<(Pipeline<Frame>, Vec<SensorSource>)> {
        let spec = PipelineSpec::from_path(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        let mut pipeline = Pipeline::from_spec(&spec, &registry(epoch))?;

        let sources: Vec<String> = pipeline.input_sources().map(str::to_string).collect();
        let mut sensors = Vec::with_capacity(sources.len());
        for source in sources {
            let mut sensor = SensorSource::new(
                SensorConfig {
                    step: StepConfig::named(source.as_str()),
                    rate_hz: self.rate_hz,
                    ..SensorConfig::default()
                },
                epoch,
            );
            sensor.reset()?;
            let rx = sensor
                .output()
                .ok_or_else(|| anyhow!("sensor '{}' has no output", source))?;
            pipeline.bind_input(&source, rx)?;
            sensors.push(sensor);
        }

        pipeline.reset()?;
        Ok((pipeline, sensors))
    }
}

/// 运行已 reset 的流水线与外部传感器，并消费所有未连接的输出
///
/// 流水线结束后取消 `ctx`，让仍在运行的外部传感器退出。
pub fn run_pipeline(
    pipeline: &mut Pipeline<Frame>,
    sensors: &mut [SensorSource],
    ctx: &Context,
) -> Result<RunSummary> {
    let terminals: Vec<(String, _)> = pipeline
        .unconnected_outputs()
        .into_iter()
        .filter_map(|(id, port)| {
            let name = pipeline.get_step(id)?.name().to_string();
            let rx = pipeline.output_at(id, port)?;
            Some((format!("{}[{}]", name, port), rx))
        })
        .collect();
    info!("Draining {} terminal outputs", terminals.len());

    thread::scope(|s| -> Result<RunSummary> {
        for sensor in sensors.iter_mut() {
            s.spawn(move || sensor.run(ctx));
        }
        let drains: Vec<_> = terminals
            .into_iter()
            .map(|(label, rx)| s.spawn(move || (label, drain(rx, |_| {}))))
            .collect();

        let result = pipeline.run(ctx);
        ctx.cancel();
        result?;

        let outputs = drains
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("drain thread panicked")))
            .collect::<Result<Vec<_>>>()?;
        Ok(RunSummary { outputs })
    })
}
