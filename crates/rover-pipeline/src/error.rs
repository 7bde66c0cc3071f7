//! 流水线错误类型定义

use thiserror::Error;

/// 流水线错误类型
///
/// # 分类
///
/// - **队列信号**: `EndOfStream`（上游正常关闭）、`Drop`（丢弃策略下队列满，可恢复）、
///   `Cancelled`（上下文取消）、`Disconnected`（下游已全部释放）
/// - **配置错误**: 在 `reset()` / 构建阶段尽早失败，避免运行期死锁
/// - **初始化错误**: 仅对当前步骤致命，下游会观察到提前的 end-of-stream
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 上游队列已关闭且已读空（唯一的“干净”终止信号）
    #[error("End of stream")]
    EndOfStream,

    /// 丢弃策略下队列已满，记录被丢弃（非致命）
    #[error("Queue full, record dropped")]
    Drop,

    /// 运行上下文已取消
    #[error("Context cancelled")]
    Cancelled,

    /// 队列另一端已全部释放
    #[error("Queue disconnected")]
    Disconnected,

    /// 无效配置（容量为 0、Aligner 没有输入源等）
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// 单输入步骤重复连接上游
    #[error("Step '{step}' accepts exactly one upstream queue")]
    AlreadyConnected { step: String },

    /// 步骤没有连接上游
    #[error("Step '{step}' has no upstream queue")]
    NotConnected { step: String },

    /// 步骤在 `reset()` 之前被使用
    #[error("Step '{step}' must be reset before use")]
    NotReset { step: String },

    /// 步骤初始化失败（对当前步骤致命）
    #[error("Step '{step}' init failed: {source}")]
    Init {
        step: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 注册表中不存在此步骤类型
    #[error("Unknown step kind: {0}")]
    UnknownStepKind(String),

    /// 流水线中不存在此步骤
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// 流水线中已存在同名步骤
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    /// 配置文件解析错误
    #[error("Config parse error: {0}")]
    Config(String),
}

impl PipelineError {
    /// 是否为上游正常关闭
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PipelineError::EndOfStream)
    }

    /// 是否为可恢复的丢弃信号
    pub fn is_drop(&self) -> bool {
        matches!(self, PipelineError::Drop)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}
