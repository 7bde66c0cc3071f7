//! 流水线描述文件
//!
//! 支持 JSON 与 TOML 两种格式，结构相同：
//!
//! ```toml
//! chains = [["sync", "fps"]]
//!
//! [[steps]]
//! name = "sync"
//! kind = "align"
//! options = { capacity = 8, retention = { max_count = 4 } }
//!
//! [[steps]]
//! name = "fps"
//! kind = "rate"
//!
//! [[inputs]]
//! step = "sync"
//! source = "camera_left"
//! ```
//!
//! `options` 会原样交给步骤类型对应的构造函数；未识别的键被忽略。

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// 单个步骤描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// 步骤名称（流水线内唯一）
    pub name: String,
    /// 注册表中的步骤类型
    pub kind: String,
    /// 步骤配置
    #[serde(default)]
    pub options: serde_json::Value,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// 将 `options` 解析为具体配置类型
    ///
    /// 步骤名称总是取自 `name`，覆盖 `options` 中的同名键。
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        let mut options = match &self.options {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': options must be a table, got {}",
                    self.name, other
                )));
            },
        };
        options.insert(
            "name".to_string(),
            serde_json::Value::String(self.name.clone()),
        );
        serde_json::from_value(serde_json::Value::Object(options)).map_err(|e| {
            PipelineError::InvalidConfig(format!("step '{}': {}", self.name, e))
        })
    }
}

/// 外部输入绑定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// 接收输入的步骤
    pub step: String,
    /// 外部生产者名称
    pub source: String,
}

/// 流水线描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSpec {
    pub steps: Vec<StepSpec>,
    /// 连接链：每条链按顺序两两连接
    pub chains: Vec<Vec<String>>,
    pub inputs: Vec<InputSpec>,
}

impl PipelineSpec {
    pub fn from_json(s: &str) -> Result<Self, PipelineError> {
        let spec: Self = serde_json::from_str(s)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_toml(s: &str) -> Result<Self, PipelineError> {
        let spec: Self = toml::from_str(s)?;
        spec.validate()?;
        Ok(spec)
    }

    /// 从文件加载（按扩展名选择格式，`.json` 以外均按 TOML 解析）
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// 检查名称唯一性与引用完整性
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut names = HashSet::new();
        for step in self.steps.iter() {
            if step.name.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "step of kind '{}' has an empty name",
                    step.kind
                )));
            }
            if !names.insert(step.name.as_str()) {
                return Err(PipelineError::DuplicateStep(step.name.clone()));
            }
        }

        let referenced = self
            .chains
            .iter()
            .flatten()
            .chain(self.inputs.iter().map(|i| &i.step));
        for name in referenced {
            if !names.contains(name.as_str()) {
                return Err(PipelineError::StepNotFound(name.clone()));
            }
        }

        let mut sources = HashSet::new();
        for input in self.inputs.iter() {
            if !sources.insert(input.source.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "input source '{}' is bound more than once",
                    input.source
                )));
            }
        }
        Ok(())
    }
}
