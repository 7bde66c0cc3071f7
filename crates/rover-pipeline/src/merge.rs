//! Merge（扇入）
//!
//! 将 N 个上游队列合并为一个下游队列。每个上游由独立线程排空，
//! 所有排空线程共享同一个输出写端的克隆（crossbeam 通道多生产者安全，无需额外加锁）。
//!
//! # 顺序
//!
//! - 同一上游内保持 FIFO
//! - 不同上游之间按到达顺序非确定性交错
//!
//! # 终止
//!
//! 默认（[`MergeTermination::OnCancel`]）只在上下文取消时返回：Merge 设计为与流水线同寿命，
//! 部分生产者提前结束不会导致 Merge 提前结束。需要“所有上游耗尽即结束”的场景使用
//! [`MergeTermination::AllExhausted`]。

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::{QueueReceiver, QueueSender, SendPolicy, receive};
use crate::step::{Flow, Output, Step, StepConfig, forward, log_receive_error};
use rover_record::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// Merge 终止策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeTermination {
    /// 仅在上下文取消时返回
    #[default]
    OnCancel,
    /// 所有上游耗尽（或上下文取消）时返回
    AllExhausted,
}

/// Merge 配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    pub termination: MergeTermination,
}

/// 扇入步骤
pub struct Merge<R> {
    config: MergeConfig,
    inputs: Vec<QueueReceiver<R>>,
    output: Output<R>,
    metrics: Arc<StepMetrics>,
}

impl<R: Record> Merge<R> {
    pub fn new(config: MergeConfig) -> Self {
        let output = Output::new(config.step.capacity);
        Self {
            config,
            inputs: Vec::new(),
            output,
            metrics: Arc::new(StepMetrics::new()),
        }
    }

    /// 已连接的上游数量
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

impl<R: Record> Step<R> for Merge<R> {
    fn name(&self) -> &str {
        &self.config.step.name
    }

    fn kind(&self) -> &'static str {
        "merge"
    }

    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.inputs.push(input);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inputs.clear();
    }

    fn output(&self) -> Option<QueueReceiver<R>> {
        self.output.receiver()
    }

    fn run(&mut self, ctx: &Context) {
        let name = self.config.step.name.as_str();
        let Some(tx) = self.output.take_sender() else {
            warn!("{}: run() called without reset(), skipping", name);
            return;
        };
        let policy = self.config.step.send_policy;
        let termination = self.config.termination;
        let metrics: &StepMetrics = &self.metrics;

        thread::scope(|s| {
            for (idx, input) in self.inputs.iter().enumerate() {
                let tx = tx.clone();
                s.spawn(move || drain(ctx, idx, input, &tx, policy, metrics, name));
            }

            if termination == MergeTermination::OnCancel {
                ctx.wait();
            }
        });

        // 所有排空线程已 join，释放最后一个写端即关闭输出
        drop(tx);
        debug!("{}: output closed", name);
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        self.config.step.validate()?;
        self.output = Output::new(self.config.step.capacity);
        self.output.reset()?;
        self.metrics.reset();
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}

/// 排空单个上游
///
/// 除 `Drop` 之外的发送错误会停止该上游的排空线程。
fn drain<R>(
    ctx: &Context,
    idx: usize,
    input: &QueueReceiver<R>,
    tx: &QueueSender<R>,
    policy: SendPolicy,
    metrics: &StepMetrics,
    step: &str,
) {
    loop {
        let record = match receive(ctx, input) {
            Ok(record) => record,
            Err(e) => {
                log_receive_error(step, &e, metrics);
                break;
            },
        };
        metrics.inc_received();

        if forward(ctx, tx, record, policy, metrics, step) == Flow::Stop {
            break;
        }
    }
    trace!("{}: input {} drained", step, idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::make_queue;
    use rover_record::Frame;
    use std::time::{Duration, Instant};

    fn merge(termination: MergeTermination) -> Merge<Frame> {
        Merge::new(MergeConfig {
            step: StepConfig::named("merge").with_capacity(64),
            termination,
        })
    }

    #[test]
    fn test_merge_all_exhausted_collects_everything_in_order() {
        let mut step = merge(MergeTermination::AllExhausted);
        let (tx_a, rx_a) = make_queue(16).unwrap();
        let (tx_b, rx_b) = make_queue(16).unwrap();
        step.connect(rx_a).unwrap();
        step.connect(rx_b).unwrap();
        step.reset().unwrap();
        let out = step.output().unwrap();

        for i in 0..5 {
            tx_a.send(Frame::new(i, i * 10).with_field("src", "a")).unwrap();
            tx_b.send(Frame::new(i, i * 10).with_field("src", "b")).unwrap();
        }
        drop(tx_a);
        drop(tx_b);

        let ctx = Context::new();
        step.run(&ctx);

        let received: Vec<Frame> = out.iter().collect();
        assert_eq!(received.len(), 10);

        // 每个上游内部保持顺序
        for src in ["a", "b"] {
            let indices: Vec<i64> = received
                .iter()
                .filter(|f| f.fields()["src"].as_str() == Some(src))
                .map(|f| f.index)
                .collect();
            assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(step.metrics().snapshot().received, 10);
    }

    #[test]
    fn test_merge_on_cancel_waits_for_cancellation() {
        let mut step = merge(MergeTermination::OnCancel);
        let (tx, rx) = make_queue::<Frame>(4).unwrap();
        step.connect(rx).unwrap();
        step.reset().unwrap();
        let out = step.output().unwrap();
        drop(tx);

        let ctx = Context::new();
        let canceller = ctx.clone();
        let handle = thread::spawn(move || {
            step.run(&canceller);
            step
        });

        // 上游已耗尽，但 Merge 仍在运行
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        let start = Instant::now();
        ctx.cancel();
        let _step = handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(out.recv().is_err(), "output must be closed after run");
    }

    #[test]
    fn test_merge_without_reset_is_noop() {
        let mut step = merge(MergeTermination::AllExhausted);
        assert!(step.output().is_none());
        step.run(&Context::new());
        assert!(step.output().is_none());
    }

    #[test]
    fn test_merge_rejects_zero_capacity() {
        let mut step: Merge<Frame> = Merge::new(MergeConfig {
            step: StepConfig::named("merge").with_capacity(0),
            termination: MergeTermination::OnCancel,
        });
        assert!(matches!(step.reset(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_merge_config_from_json() {
        let config: MergeConfig =
            serde_json::from_str(r#"{"name": "m", "termination": "all_exhausted"}"#).unwrap();
        assert_eq!(config.step.name, "m");
        assert_eq!(config.termination, MergeTermination::AllExhausted);
    }
}
