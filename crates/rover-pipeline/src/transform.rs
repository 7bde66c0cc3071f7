//! Transform（逐条处理）
//!
//! 包装用户提供的 [`Processor`]，对每条输入记录生成一条新的输出记录。
//!
//! # 每条记录的处理流程
//!
//! 1. 从上游读取 `src`
//! 2. 构造 `dst`：先复制静态字段模板，再用 `src` 的字段覆盖（静态字段可被逐条覆盖）
//! 3. 步骤启用时调用 `process(&src, &mut dst)`
//! 4. `process` 失败：记录 warn 日志并 **丢弃** 该条记录，继续处理下一条（非致命）
//! 5. 成功：按步骤发送策略写入下游
//!
//! `init()` 在读取循环前运行一次，失败时步骤直接退出（下游观察到提前的 end-of-stream）；
//! `close()` 在读取循环结束后运行一次（包括 `process` panic 展开时）。

use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::StepMetrics;
use crate::queue::{QueueReceiver, receive};
use crate::step::{Flow, Input, Output, Step, StepConfig, forward, log_receive_error};
use rover_record::{Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 逐条处理接口
///
/// 除 `process` 外的生命周期钩子都有空的默认实现。
pub trait Processor<R>: Send {
    /// 读取循环开始前调用一次；失败对当前步骤致命
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 步骤 `reset()` 时调用
    fn reset(&mut self) {}

    /// 处理一条记录
    ///
    /// `dst` 已包含静态字段和 `src` 的全部字段。返回错误时该条记录被丢弃。
    fn process(&mut self, src: &R, dst: &mut R) -> anyhow::Result<()>;

    /// 读取循环结束后调用一次
    fn close(&mut self) {}
}

type ProcessFn<R> = Box<dyn FnMut(&R, &mut R) -> anyhow::Result<()> + Send>;
type InitFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;
type HookFn = Box<dyn FnMut() + Send>;

/// 基于闭包的处理器
///
/// # Example
///
/// ```
/// use rover_pipeline::FnProcessor;
/// use rover_record::{Frame, Record, Value};
///
/// let processor = FnProcessor::new(|src: &Frame, dst: &mut Frame| {
///     dst.set_field("doubled", Value::Int(src.index() * 2));
///     Ok(())
/// })
/// .with_init(|| Ok(()));
/// # let _ = processor;
/// ```
pub struct FnProcessor<R> {
    process: ProcessFn<R>,
    init: Option<InitFn>,
    reset: Option<HookFn>,
    close: Option<HookFn>,
}

impl<R> FnProcessor<R> {
    pub fn new<F>(process: F) -> Self
    where
        F: FnMut(&R, &mut R) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            process: Box::new(process),
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

impl<R> Processor<R> for FnProcessor<R> {
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

    fn process(&mut self, src: &R, dst: &mut R) -> anyhow::Result<()> {
        (self.process)(src, dst)
    }

    fn close(&mut self) {
        if let Some(f) = self.close.as_mut() {
            f();
        }
    }
}

/// 直通处理器（只做静态字段合并）
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl<R> Processor<R> for Passthrough {
    fn process(&mut self, _src: &R, _dst: &mut R) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Transform 配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    #[serde(flatten)]
    pub step: StepConfig,
    /// 静态字段（每条输出记录的默认字段）
    pub fields: BTreeMap<String, Value>,
}

impl TransformConfig {
    /// 由静态字段构造记录模板；没有静态字段时返回 `None`
    pub fn template<R: Record + Default>(&self) -> Option<R> {
        if self.fields.is_empty() {
            return None;
        }
        let mut template = R::default();
        for (key, value) in self.fields.iter() {
            template.set_field(key, value.clone());
        }
        Some(template)
    }
}

/// 离开作用域时调用 `close()`
struct CloseOnDrop<'a, R: Record>(&'a mut Box<dyn Processor<R>>);

impl<R: Record> Drop for CloseOnDrop<'_, R> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// 逐条处理步骤
pub struct Transform<R> {
    config: StepConfig,
    kind: &'static str,
    processor: Box<dyn Processor<R>>,
    template: Option<R>,
    input: Input<R>,
    output: Output<R>,
    metrics: Arc<StepMetrics>,
    failure: Option<PipelineError>,
}

impl<R: Record> Transform<R> {
    pub fn new(config: StepConfig, processor: impl Processor<R> + 'static) -> Self {
        Self::from_boxed(config, Box::new(processor))
    }

    pub fn from_boxed(config: StepConfig, processor: Box<dyn Processor<R>>) -> Self {
        let output = Output::new(config.capacity);
        Self {
            config,
            kind: "transform",
            processor,
            template: None,
            input: Input::new(),
            output,
            metrics: Arc::new(StepMetrics::new()),
            failure: None,
        }
    }

    /// 设置静态字段模板
    #[must_use]
    pub fn with_fields(mut self, template: R) -> Self {
        self.template = Some(template);
        self
    }

    /// 覆盖注册表中的类型名
    #[must_use]
    pub fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// 上一次运行的致命错误（`init()` 失败）
    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    fn make_output(template: Option<&R>, src: &R) -> R {
        match template {
            Some(template) => {
                let mut dst = template.clone();
                dst.copy_from(src);
                dst
            },
            None => src.clone(),
        }
    }
}

impl<R: Record> Step<R> for Transform<R> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn connect(&mut self, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.input.connect(&self.config.name, input)
    }

    fn disconnect(&mut self) {
        self.input.disconnect();
    }

    fn output(&self) -> Option<QueueReceiver<R>> {
        self.output.receiver()
    }

    fn run(&mut self, ctx: &Context) {
        let Some(tx) = self.output.take_sender() else {
            warn!("{}: run() called without reset(), skipping", self.config.name);
            return;
        };
        let Some(input) = self.input.get().cloned() else {
            warn!("{}: no upstream connected, closing output", self.config.name);
            return;
        };

        if let Err(e) = self.processor.init() {
            error!("{}: init failed: {:#}", self.config.name, e);
            self.metrics.inc_errors();
            self.failure = Some(PipelineError::Init {
                step: self.config.name.clone(),
                source: e.into(),
            });
            return;
        }

        let processor = CloseOnDrop(&mut self.processor);
        loop {
            let src = match receive(ctx, &input) {
                Ok(record) => record,
                Err(e) => {
                    log_receive_error(&self.config.name, &e, &self.metrics);
                    break;
                },
            };
            self.metrics.inc_received();

            let mut dst = Self::make_output(self.template.as_ref(), &src);
            if self.config.enabled {
                if let Err(e) = processor.0.process(&src, &mut dst) {
                    warn!(
                        "{}: process failed, dropping record {}: {:#}",
                        self.config.name,
                        src.index(),
                        e
                    );
                    self.metrics.inc_errors();
                    continue;
                }
            }

            let flow = forward(
                ctx,
                &tx,
                dst,
                self.config.send_policy,
                &self.metrics,
                &self.config.name,
            );
            if flow == Flow::Stop {
                break;
            }
        }

        drop(processor);
        drop(tx);
        debug!("{}: output closed", self.config.name);
    }

    fn reset(&mut self) -> Result<(), PipelineError> {
        self.config.validate()?;
        if self.input.get().is_none() {
            return Err(PipelineError::NotConnected {
                step: self.config.name.clone(),
            });
        }
        self.output = Output::new(self.config.capacity);
        self.output.reset()?;
        self.processor.reset();
        self.metrics.reset();
        self.failure = None;
        Ok(())
    }

    fn metrics(&self) -> Arc<StepMetrics> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::make_queue;
    use rover_record::Frame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_to_end(step: &mut Transform<Frame>, inputs: Vec<Frame>) -> Vec<Frame> {
        let (tx, rx) = make_queue(inputs.len().max(1)).unwrap();
        step.connect(rx).unwrap();
        step.reset().unwrap();
        let out = step.output().unwrap();
        for frame in inputs {
            tx.send(frame).unwrap();
        }
        drop(tx);
        step.run(&Context::new());
        out.iter().collect()
    }

    #[test]
    fn test_static_fields_are_inherited_and_overridable() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let processor = FnProcessor::new(move |_src: &Frame, dst: &mut Frame| {
            // 记录 process 运行前的 dst
            seen_clone.lock().push(dst.clone());
            Ok(())
        });
        let template = Frame::new(0, 0)
            .with_field("F1", "v1")
            .with_field("gain", 1i64);
        let mut step = Transform::new(StepConfig::named("t").with_capacity(4), processor)
            .with_fields(template);

        let out = run_to_end(
            &mut step,
            vec![
                Frame::new(1, 100)
                    .with_field("F2", "v2")
                    .with_field("gain", 5i64),
            ],
        );

        let before = seen.lock()[0].clone();
        assert_eq!(before.field("F1"), Some(&Value::from("v1")));
        assert_eq!(before.field("F2"), Some(&Value::from("v2")));
        assert_eq!(before.field("gain"), Some(&Value::Int(5)));
        assert_eq!(before.index(), 1);
        assert_eq!(before.timestamp(), 100);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_process_error_drops_item_and_continues() {
        let processor = FnProcessor::new(|src: &Frame, dst: &mut Frame| {
            if src.index() % 2 == 1 {
                anyhow::bail!("odd record {}", src.index());
            }
            dst.set_field("ok", Value::Bool(true));
            Ok(())
        });
        let mut step = Transform::new(StepConfig::named("t"), processor);

        let out = run_to_end(&mut step, (0..6).map(|i| Frame::new(i, i)).collect());

        let indices: Vec<i64> = out.iter().map(|f| f.index()).collect();
        assert_eq!(indices, vec![0, 2, 4]);
        assert!(out.iter().all(|f| f.field("ok") == Some(&Value::Bool(true))));
        let snapshot = step.metrics().snapshot();
        assert_eq!(snapshot.received, 6);
        assert_eq!(snapshot.errors, 3);
        assert_eq!(snapshot.sent, 3);
    }

    #[test]
    fn test_init_failure_closes_output_without_processing() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();
        let processor = FnProcessor::new(|_src: &Frame, _dst: &mut Frame| Ok(()))
            .with_init(|| anyhow::bail!("camera not found"))
            .with_close(move || {
                closed_clone.fetch_add(1, Ordering::SeqCst);
            });
        let mut step = Transform::new(StepConfig::named("t"), processor);

        let out = run_to_end(&mut step, vec![Frame::new(0, 0)]);

        assert!(out.is_empty());
        assert!(matches!(step.failure(), Some(PipelineError::Init { .. })));
        assert_eq!(step.metrics().snapshot().received, 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_runs_once_after_loop() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();
        let processor = FnProcessor::new(|_src: &Frame, _dst: &mut Frame| Ok(())).with_close(
            move || {
                closed_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        let mut step = Transform::new(StepConfig::named("t"), processor);

        run_to_end(&mut step, vec![Frame::new(0, 0), Frame::new(1, 1)]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_step_skips_processor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let processor = FnProcessor::new(move |_src: &Frame, _dst: &mut Frame| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut step = Transform::new(StepConfig::named("t").with_enabled(false), processor);

        let out = run_to_end(&mut step, vec![Frame::new(0, 0), Frame::new(1, 1)]);
        assert_eq!(out.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_invokes_processor_reset() {
        let resets = Arc::new(AtomicUsize::new(0));
        let resets_clone = resets.clone();
        let processor = FnProcessor::new(|_src: &Frame, _dst: &mut Frame| Ok(())).with_reset(
            move || {
                resets_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        let mut step = Transform::new(StepConfig::named("t"), processor);
        let (_tx, rx) = make_queue(1).unwrap();
        step.connect(rx).unwrap();
        step.reset().unwrap();
        step.reset().unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_requires_upstream() {
        let mut step: Transform<Frame> = Transform::new(StepConfig::named("dangling"), Passthrough);
        assert!(matches!(
            step.reset(),
            Err(PipelineError::NotConnected { step: name }) if name == "dangling"
        ));
        assert!(step.output().is_none());
    }

    #[test]
    fn test_close_runs_when_process_panics() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();
        let processor = FnProcessor::new(|src: &Frame, _dst: &mut Frame| {
            if src.index() == 1 {
                panic!("bad frame");
            }
            Ok(())
        })
        .with_close(move || {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let mut step = Transform::new(StepConfig::named("t"), processor);
        let (tx, rx) = make_queue(4).unwrap();
        step.connect(rx).unwrap();
        step.reset().unwrap();
        let out = step.output().unwrap();
        for i in 0..3 {
            tx.send(Frame::new(i, i)).unwrap();
        }
        drop(tx);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            step.run(&Context::new());
        }));
        assert!(result.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        // 写端随栈展开释放
        let indices: Vec<i64> = out.iter().map(|f| f.index()).collect();
        assert_eq!(indices, vec![0]);
    }

    #[test]
    fn test_transform_config_template() {
        let config: TransformConfig =
            serde_json::from_str(r#"{"name": "stamp", "fields": {"camera": "left", "id": 2}}"#)
                .unwrap();
        let template: Frame = config.template().unwrap();
        assert_eq!(template.field("camera"), Some(&Value::from("left")));
        assert_eq!(template.field("id"), Some(&Value::Int(2)));

        assert!(TransformConfig::default().template::<Frame>().is_none());
    }
}
