//! Aligner（多源时间对齐）
//!
//! 将 K 个来源（相机、IMU、关节编码器……）的记录按最近时间戳组合成一条记录。
//!
//! # 算法
//!
//! 每当来源 `idx` 到达一条记录：
//!
//! 1. 追加到 `idx` 的缓冲区
//! 2. 若本次到达需要输出（见 [`ReferenceMode`]），在其他每个缓冲区中查找时间戳最接近的记录
//! 3. 所有缓冲区都非空时合成一条组合记录并写入下游
//! 4. 按 [`Retention`] 裁剪所有缓冲区
//!
//! 组合记录的序号/时间戳取自参考记录（触发本次输出的记录），并为每个来源 `j` 写入
//! `align_delta_<j>` 字段 = 候选时间戳 − 参考时间戳（纳秒）。
//!
//! # 线程模型
//!
//! 单线程：所有输入通过 `crossbeam_channel::Select` 多路复用，缓冲区只由该线程访问，无需加锁。
//! 已耗尽的输入从选择集合中移除；所有输入耗尽或上下文取消时关闭输出。

mod buffer;

pub use buffer::AlignBuffer;

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::QueueReceiver;
use crate::step::{Flow, Output, Step, StepConfig, forward};
use crossbeam_channel::Select;
use rover_record::{Record, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// 时间差字段前缀
pub const ALIGN_DELTA_PREFIX: &str = "align_delta_";

/// 时间差字段名
pub fn align_delta_field(source: usize) -> String {
    format!("{}{}", ALIGN_DELTA_PREFIX, source)
}

/// 缓冲区保留策略
///
/// 两个上限在每次裁剪时同时生效。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    /// 每个来源最多保留的记录数（必须 ≥ 1）
    pub max_count: usize,
    /// 最大保留时长（纳秒，相对最新到达的时间戳）
    pub max_age_ns: Option<i64>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_count: 16,
            max_age_ns: None,
        }
    }
}

/// 哪些到达会触发输出
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// 任一来源到达都输出
    #[default]
    Trigger,
    /// 只有指定来源到达时输出，其他来源只缓存
    Source(usize),
}

/// 字段冲突策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// 按来源序号 0..K-1 依次写入，后写覆盖先写
    #[default]
    LastSourceWins,
    /// 参考记录最后写入
    ReferenceWins,
}

/// Aligner 配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    pub retention: Retention,
    pub reference: ReferenceMode,
    pub collision: CollisionPolicy,
    /// 匹配后移除被使用的记录及更早的记录（每条记录最多参与一次组合）
    pub consume: bool,
}

impl AlignerConfig {
    fn validate(&self, sources: usize) -> Result<(), PipelineError> {
        self.step.validate()?;
        if sources == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "aligner '{}': at least one source is required",
                self.step.name
            )));
        }
        if self.retention.max_count == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "aligner '{}': retention.max_count must be at least 1",
                self.step.name
            )));
        }
        if let Some(age) = self.retention.max_age_ns {
            if age < 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "aligner '{}': retention.max_age_ns must not be negative",
                    self.step.name
                )));
            }
        }
        if let ReferenceMode::Source(r) = self.reference {
            if r >= sources {
                return Err(PipelineError::InvalidConfig(format!(
                    "aligner '{}': reference source {} out of range ({} sources)",
                    self.step.name, r, sources
                )));
            }
        }
        Ok(())
    }
}

/// 每个缓冲区预分配的最大条目数（更大的 `max_count` 按需增长）
const MAX_PREALLOCATED: usize = 64;

/// 每个来源的匹配位置
type Matches = SmallVec<[(usize, usize); 8]>;

enum Event<R> {
    Record(usize, R),
    Exhausted(usize),
    Cancelled,
}

/// 多源时间对齐步骤
pub struct Aligner<R> {
    config: AlignerConfig,
    inputs: Vec<QueueReceiver<R>>,
    buffers: Vec<AlignBuffer<R>>,
    output: Output<R>,
    metrics: Arc<StepMetrics>,
}

impl<R: Record> Aligner<R> {
    pub fn new(config: AlignerConfig) -> Self {
        let output = Output::new(config.step.capacity);
        Self {
            config,
            inputs: Vec::new(),
            buffers: Vec::new(),
            output,
            metrics: Arc::new(StepMetrics::new()),
        }
    }

    /// 来源数量
    pub fn source_count(&self) -> usize {
        self.inputs.len()
    }

    /// 各来源当前缓存的记录数
    pub fn buffered(&self) -> Vec<usize> {
        self.buffers.iter().map(AlignBuffer::len).collect()
    }

    /// 处理来源 `source` 的一条记录，返回可能产生的组合记录
    fn align(&mut self, source: usize, record: R) -> Option<R> {
        let reference_ts = record.timestamp();
        self.buffers[source].add(record);

        let emit = match self.config.reference {
            ReferenceMode::Trigger => true,
            ReferenceMode::Source(r) => r == source,
        };

        let mut combined = None;
        if emit {
            if let Some(matches) = self.find_matches(source, reference_ts) {
                combined = self.combine(source, &matches);
                if self.config.consume {
                    for &(j, pos) in matches.iter() {
                        self.buffers[j].drain_through(pos);
                    }
                }
            }
        }

        self.prune(reference_ts);
        combined
    }

    fn find_matches(&self, source: usize, reference_ts: i64) -> Option<Matches> {
        let mut matches = Matches::new();
        for (j, buffer) in self.buffers.iter().enumerate() {
            if j == source {
                matches.push((j, buffer.len().saturating_sub(1)));
                continue;
            }
            let (pos, _) = buffer.find_closest(reference_ts)?;
            matches.push((j, pos));
        }
        Some(matches)
    }

    fn combine(&self, source: usize, matches: &Matches) -> Option<R> {
        let reference = self.buffers[source].get(matches[source].1)?;
        let (index, timestamp) = (reference.index(), reference.timestamp());

        let mut order: SmallVec<[usize; 8]> = (0..matches.len()).collect();
        if self.config.collision == CollisionPolicy::ReferenceWins {
            order.retain(|j| *j != source);
            order.push(source);
        }

        let (first, rest) = order.split_first()?;
        let mut out = self.buffers[*first].get(matches[*first].1)?.clone();
        for &j in rest {
            out.copy_from(self.buffers[j].get(matches[j].1)?);
        }
        out.set_index(index);
        out.set_timestamp(timestamp);
        for &(j, pos) in matches.iter() {
            let candidate_ts = self.buffers[j].get(pos)?.timestamp();
            out.set_field(
                &align_delta_field(j),
                Value::Int(candidate_ts.saturating_sub(timestamp)),
            );
        }
        Some(out)
    }

    fn prune(&mut self, newest_ts: i64) {
        let retention = self.config.retention;
        for buffer in self.buffers.iter_mut() {
            buffer.prune(retention.max_count);
            if let Some(age) = retention.max_age_ns {
                buffer.prune_older_than(newest_ts.saturating_sub(age));
            }
        }
    }

    /// 等待任一活跃输入或取消信号
    fn next_event(&self, ctx: &Context, live: &[usize]) -> Event<R> {
        let mut sel = Select::new();
        for &source in live {
            sel.recv(&self.inputs[source]);
        }
        let done = sel.recv(ctx.done());

        let oper = sel.select();
        let op = oper.index();
        if op == done {
            let _ = oper.recv(ctx.done());
            return Event::Cancelled;
        }
        let source = live[op];
        match oper.recv(&self.inputs[source]) {
            Ok(record) => Event::Record(source, record),
            Err(_) => Event::Exhausted(op),
        }
    }
}

impl<R: Record> Step<R> for Aligner<R> {
    fn name(&self) -> &str {
        &self.config.step.name
    }

    fn kind(&self) -> &'static str {
        "align"
    }

    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.inputs.push(input);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inputs.clear();
        self.buffers.clear();
    }

    fn output(&self) -> Option<QueueReceiver<R>> {
        self.output.receiver()
    }

    fn run(&mut self, ctx: &Context) {
        let Some(tx) = self.output.take_sender() else {
            warn!("{}: run() called without reset(), skipping", self.config.step.name);
            return;
        };
        if self.buffers.len() != self.inputs.len() {
            warn!(
                "{}: sources changed since reset() ({} buffers, {} inputs), skipping",
                self.config.step.name,
                self.buffers.len(),
                self.inputs.len()
            );
            return;
        }

        let mut live: Vec<usize> = (0..self.inputs.len()).collect();
        while !live.is_empty() {
            if ctx.is_cancelled() {
                debug!("{}: cancelled", self.config.step.name);
                break;
            }

            match self.next_event(ctx, &live) {
                Event::Record(source, record) => {
                    self.metrics.inc_received();
                    trace!(
                        "{}: source {} ts={}",
                        self.config.step.name,
                        source,
                        record.timestamp()
                    );
                    let Some(combined) = self.align(source, record) else {
                        continue;
                    };
                    let flow = forward(
                        ctx,
                        &tx,
                        combined,
                        self.config.step.send_policy,
                        &self.metrics,
                        &self.config.step.name,
                    );
                    if flow == Flow::Stop {
                        break;
                    }
                },
                Event::Exhausted(op) => {
                    let source = live.remove(op);
                    debug!("{}: source {} exhausted", self.config.step.name, source);
                },
                Event::Cancelled => {
                    debug!("{}: cancelled", self.config.step.name);
                    break;
                },
            }
        }

        drop(tx);
        debug!("{}: output closed", self.config.step.name);
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        let sources = self.inputs.len();
        self.config.validate(sources)?;
        let preallocate = self.config.retention.max_count.min(MAX_PREALLOCATED) + 1;
        self.buffers = (0..sources)
            .map(|_| AlignBuffer::with_capacity(preallocate))
            .collect();
        self.output = Output::new(self.config.step.capacity);
        self.output.reset()?;
        self.metrics.reset();
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}
