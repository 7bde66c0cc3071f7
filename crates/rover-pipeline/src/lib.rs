//! 流水线核心模块
//!
//! 本模块提供基于步骤（Step）的流式处理框架，包括：
//! - 队列协议（有界队列、阻塞/丢弃发送策略、end-of-stream 与取消信号）
//! - 扇入 / 扇出（Merge / Split）
//! - 逐条处理与终端消费（Transform / Sink）
//! - 多源时间对齐（Aligner）
//! - 步骤注册表与流水线图（从 JSON / TOML 描述构建）
//!
//! # 线程模型
//!
//! 每个运行中的步骤占用一个线程，步骤之间只通过有界队列通信。
//! 所有阻塞点（读取、阻塞发送、Merge 等待）都同时等待 [`Context`] 的取消信号。
//!
//! # Example
//!
//! ```
//! use rover_pipeline::{Context, Pipeline, Registry, make_queue};
//! use rover_record::{Frame, Record};
//!
//! let registry = Registry::<Frame>::with_builtins();
//! let mut pipeline = Pipeline::from_json(
//!     r#"{
//!         "steps": [{"name": "stamp", "kind": "fields", "options": {"fields": {"robot": "r1"}}}],
//!         "inputs": [{"step": "stamp", "source": "imu"}]
//!     }"#,
//!     &registry,
//! )
//! .unwrap();
//!
//! let (tx, rx) = make_queue(8).unwrap();
//! pipeline.bind_input("imu", rx).unwrap();
//! pipeline.reset().unwrap();
//! let out = pipeline.output(0).unwrap();
//!
//! tx.send(Frame::new(0, 1_000)).unwrap();
//! drop(tx);
//! pipeline.run(&Context::new()).unwrap();
//!
//! let frame = out.recv().unwrap();
//! assert_eq!(frame.timestamp(), 1_000);
//! assert!(frame.field("robot").is_some());
//! ```

pub mod aligner;
pub mod config;
pub mod context;
mod error;
pub mod graph;
pub mod merge;
pub mod metrics;
pub mod queue;
pub mod rate;
pub mod registry;
pub mod sink;
pub mod split;
pub mod step;
pub mod transform;

pub use aligner::{
    ALIGN_DELTA_PREFIX, AlignBuffer, Aligner, AlignerConfig, CollisionPolicy, ReferenceMode,
    Retention, align_delta_field,
};
pub use config::{InputSpec, PipelineSpec, StepSpec};
pub use context::Context;
pub use error::PipelineError;
pub use graph::{Pipeline, StepId};
pub use merge::{Merge, MergeConfig, MergeTermination};
pub use metrics::{MetricsSnapshot, StepMetrics};
pub use queue::{QueueReceiver, QueueSender, SendPolicy, make_queue, receive, send};
pub use rate::{RateConfig, RateMeter};
pub use registry::{Registry, StepConstructor};
pub use sink::{FnSink, Sink, SinkConfig, SinkHandler};
pub use split::{Split, SplitConfig, SplitOutput};
pub use step::{DEFAULT_CAPACITY, Step, StepConfig};
pub use transform::{FnProcessor, Passthrough, Processor, Transform, TransformConfig};
