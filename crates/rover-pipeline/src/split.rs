//! Split（扇出）
//!
//! 将一个上游队列的每条记录复制到 N 个下游队列。每个下游有独立的容量和发送策略，
//! 丢弃策略的慢消费者只会丢掉自己的数据，不会拖住其他消费者。

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::{QueueReceiver, SendPolicy, receive};
use crate::step::{Flow, Input, Output, Step, StepConfig, forward, log_receive_error};
use rover_record::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 单个下游端口配置（未设置的字段继承步骤配置）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitOutput {
    pub capacity: Option<usize>,
    pub send_policy: Option<SendPolicy>,
}

impl SplitOutput {
    pub fn with_policy(policy: SendPolicy) -> Self {
        Self {
            capacity: None,
            send_policy: Some(policy),
        }
    }
}

/// Split 配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    /// 下游端口列表（至少一个）
    pub outputs: Vec<SplitOutput>,
}

impl SplitConfig {
    /// `n` 个继承步骤配置的端口
    pub fn with_outputs(step: StepConfig, n: usize) -> Self {
        Self {
            step,
            outputs: vec![SplitOutput::default(); n],
        }
    }
}

struct Port<R> {
    output: Output<R>,
    policy: SendPolicy,
}

/// 扇出步骤
pub struct Split<R> {
    config: SplitConfig,
    input: Input<R>,
    ports: Vec<Port<R>>,
    metrics: Arc<StepMetrics>,
}

impl<R: Record> Split<R> {
    pub fn new(config: SplitConfig) -> Self {
        let ports = Self::build_ports(&config);
        Self {
            config,
            input: Input::new(),
            ports,
            metrics: Arc::new(StepMetrics::new()),
        }
    }

    /// 追加一个下游端口，返回端口号
    ///
    /// 新端口在下一次 `reset()` 后生效。
    pub fn add_output(&mut self, output: SplitOutput) -> usize {
        self.config.outputs.push(output);
        self.ports = Self::build_ports(&self.config);
        self.config.outputs.len() - 1
    }

    fn build_ports(config: &SplitConfig) -> Vec<Port<R>> {
        config
            .outputs
            .iter()
            .map(|o| Port {
                output: Output::new(o.capacity.unwrap_or(config.step.capacity)),
                policy: o.send_policy.unwrap_or(config.step.send_policy),
            })
            .collect()
    }
}

impl<R: Record> Step<R> for Split<R> {
    fn name(&self) -> &str {
        &self.config.step.name
    }

    fn kind(&self) -> &'static str {
        "split"
    }

    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.input.connect(&self.config.step.name, input)
    }

    fn disconnect(&mut self) {
        self.input.disconnect();
    }

    fn output(&self) -> Option<QueueReceiver<R>> {
        self.output_at(0)
    }

    fn output_count(&self) -> usize {
        self.ports.len()
    }

    fn output_at(&self, port: usize) -> Option<QueueReceiver<R>> {
        self.ports.get(port).and_then(|p| p.output.receiver())
    }

    fn run(&mut self, ctx: &Context) {
        let name = self.config.step.name.as_str();
        let senders: Option<Vec<_>> = self
            .ports
            .iter_mut()
            .map(|p| p.output.take_sender().map(|tx| (tx, p.policy)))
            .collect();
        let Some(senders) = senders else {
            warn!("{}: run() called without reset(), skipping", name);
            return;
        };
        let Some(input) = self.input.get() else {
            warn!("{}: no upstream connected, closing outputs", name);
            return;
        };
        let metrics: &StepMetrics = &self.metrics;

        'outer: loop {
            let record = match receive(ctx, input) {
                Ok(record) => record,
                Err(e) => {
                    log_receive_error(name, &e, metrics);
                    break;
                },
            };
            metrics.inc_received();

            for (tx, policy) in senders.iter() {
                if forward(ctx, tx, record.clone(), *policy, metrics, name) == Flow::Stop {
                    break 'outer;
                }
            }
        }

        drop(senders);
        debug!("{}: {} outputs closed", name, self.ports.len());
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        self.config.step.validate()?;
        if self.config.outputs.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "split '{}': at least one output is required",
                self.config.step.name
            )));
        }
        if self.input.get().is_none() {
            return Err(PipelineError::NotConnected {
                step: self.config.step.name.clone(),
            });
        }
        self.ports = Self::build_ports(&self.config);
        for port in self.ports.iter_mut() {
            port.output.reset()?;
        }
        self.metrics.reset();
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}
