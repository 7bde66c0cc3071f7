//! Sink（终端消费）
//!
//! 将每条记录交给 [`SinkHandler`]（写盘、显示、发布到外部系统等）。
//! `forward = true` 时记录在消费后继续写入下游，便于在链路中间插入观测点。

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::{QueueReceiver, receive};
use crate::step::{Flow, Input, Output, Step, StepConfig, forward, log_receive_error};
use rover_record::Record;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 终端消费接口
pub trait SinkHandler<R>: Send {
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    /// 消费一条记录；错误只记录日志，不终止步骤
    fn sink(&mut self, record: &R) -> anyhow::Result<()>;

    fn close(&mut self) {}
}

type SinkFn<R> = Box<dyn FnMut(&R) -> anyhow::Result<()> + Send>;
type InitFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;
type HookFn = Box<dyn FnMut() + Send>;

/// 基于闭包的消费者
pub struct FnSink<R> {
    sink: SinkFn<R>,
    init: Option<InitFn>,
    reset: Option<HookFn>,
    close: Option<HookFn>,
}

impl<R> FnSink<R> {
    pub fn new<F>(sink: F) -> Self
    where
        F: FnMut(&R) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            sink: Box::new(sink),
            init: None,
            reset: None,
            close: None,
        }
    }

    #[must_use]
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    #[must_use]
    pub fn with_reset<F>(mut self, reset: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    #[must_use]
    pub fn with_close<F>(mut self, close: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.close = Some(Box::new(close));
        self
    }
}

impl<R> SinkHandler<R> for FnSink<R> {
    fn init(&mut self) -> anyhow::Result<()> {
        match self.init.as_mut() {
            Some(f) => f(),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        if let Some(f) = self.reset.as_mut() {
            f();
        }
    }

    fn sink(&mut self, record: &R) -> anyhow::Result<()> {
        (self.sink)(record)
    }

    fn close(&mut self) {
        if let Some(f) = self.close.as_mut() {
            f();
        }
    }
}

/// Sink 配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    /// 消费后是否继续写入下游
    pub forward: bool,
}

/// 离开作用域时调用 `close()`
struct CloseOnDrop<'a, R>(&'a mut Box<dyn SinkHandler<R>>);

impl<R> Drop for CloseOnDrop<'_, R> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// 终端消费步骤
pub struct Sink<R> {
    config: SinkConfig,
    handler: Box<dyn SinkHandler<R>>,
    input: Input<R>,
    output: Output<R>,
    metrics: Arc<StepMetrics>,
    failure: Option<PipelineError>,
}

impl<R: Record> Sink<R> {
    pub fn new(config: SinkConfig, handler: impl SinkHandler<R> + 'static) -> Self {
        let output = Output::new(config.step.capacity);
        Self {
            config,
            handler: Box::new(handler),
            input: Input::new(),
            output,
            metrics: Arc::new(StepMetrics::new()),
            failure: None,
        }
    }

    /// 上一次运行的致命错误（`init()` 失败）
    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }
}

impl<R: Record> Step<R> for Sink<R> {
    fn name(&self) -> &str {
        &self.config.step.name
    }

    fn kind(&self) -> &'static str {
        "sink"
    }

    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.input.connect(&self.config.step.name, input)
    }

    fn disconnect(&mut self) {
        self.input.disconnect();
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
        let Some(input) = self.input.get() else {
            warn!("{}: no upstream connected, closing output", name);
            return;
        };

        if let Err(e) = self.handler.init() {
            error!("{}: init failed: {:#}", name, e);
            self.metrics.inc_errors();
            self.failure = Some(PipelineError::Init {
                step: name.to_string(),
                source: e.into(),
            });
            return;
        }

        let handler = CloseOnDrop(&mut self.handler);
        loop {
            let record = match receive(ctx, input) {
                Ok(record) => record,
                Err(e) => {
                    log_receive_error(name, &e, &self.metrics);
                    break;
                },
            };
            self.metrics.inc_received();

            if self.config.step.enabled {
                if let Err(e) = handler.0.sink(&record) {
                    warn!("{}: sink failed for record {}: {:#}", name, record.index(), e);
                    self.metrics.inc_errors();
                }
            }

            if self.config.forward {
                let flow = forward(
                    ctx,
                    &tx,
                    record,
                    self.config.step.send_policy,
                    &self.metrics,
                    name,
                );
                if flow == Flow::Stop {
                    break;
                }
            }
        }

        drop(handler);
        drop(tx);
        debug!("{}: output closed", name);
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        self.config.step.validate()?;
        if self.input.get().is_none() {
            return Err(PipelineError::NotConnected {
                step: self.config.step.name.clone(),
            });
        }
        self.output = Output::new(self.config.step.capacity);
        self.output.reset()?;
        self.handler.reset();
        self.metrics.reset();
        self.failure = None;
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}
