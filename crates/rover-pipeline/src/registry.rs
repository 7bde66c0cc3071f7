//! 步骤类型注册表
//!
//! 类型名 → 构造函数。注册表是显式传递的值（不是全局单例），
//! 不同流水线可以使用不同的注册表，测试也可以注册自己的模拟步骤。

use crate::aligner::{Aligner, AlignerConfig};
use crate::config::StepSpec;
use crate::error::PipelineError;
use crate::merge::{Merge, MergeConfig};
use crate::rate::{RateConfig, RateMeter};
use crate::split::{Split, SplitConfig};
use crate::step::{Step, StepConfig};
use crate::transform::{Passthrough, Transform, TransformConfig};
use rover_record::Record;
use std::collections::BTreeMap;

/// 步骤构造函数
pub type StepConstructor<R> =
    Box<dyn Fn(&StepSpec) -> Result<Box<dyn Step<R>>, PipelineError> + Send + Sync>;

/// 步骤类型注册表
pub struct Registry<R> {
    constructors: BTreeMap<String, StepConstructor<R>>,
}

impl<R: Record> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Registry<R> {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// 注册步骤类型（同名类型被替换）
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&StepSpec) -> Result<Box<dyn Step<R>>, PipelineError> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self
            .constructors
            .insert(kind.clone(), Box::new(constructor))
            .is_some()
        {
            tracing::debug!("Step kind '{}' re-registered", kind);
        }
        self
    }

    /// 按描述构造步骤
    pub fn build(&self, spec: &StepSpec) -> Result<Box<dyn Step<R>>, PipelineError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| PipelineError::UnknownStepKind(spec.kind.clone()))?;
        constructor(spec)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// 已注册的类型名（有序）
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl<R: Record + Default> Registry<R> {
    /// 包含内置步骤类型的注册表
    ///
    /// | 类型 | 步骤 |
    /// |------|------|
    /// | `merge` | [`Merge`] |
    /// | `split` | [`Split`] |
    /// | `align` | [`Aligner`] |
    /// | `rate` | [`Transform`] + [`RateMeter`] |
    /// | `fields` | 只写入静态字段的 [`Transform`] |
    /// | `passthrough` | 直通 [`Transform`] |
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("merge", |spec| {
                let config: MergeConfig = spec.options()?;
                Ok(Box::new(Merge::<R>::new(config)))
            })
            .register("split", |spec| {
                let config: SplitConfig = spec.options()?;
                Ok(Box::new(Split::<R>::new(config)))
            })
            .register("align", |spec| {
                let config: AlignerConfig = spec.options()?;
                Ok(Box::new(Aligner::<R>::new(config)))
            })
            .register("rate", |spec| {
                let config: RateConfig = spec.options()?;
                let step = Transform::<R>::new(config.step, RateMeter::new(config.window));
                Ok(Box::new(step.with_kind("rate")))
            })
            .register("fields", |spec| {
                let config: TransformConfig = spec.options()?;
                let mut step =
                    Transform::<R>::new(config.step.clone(), Passthrough).with_kind("fields");
                if let Some(template) = config.template::<R>() {
                    step = step.with_fields(template);
                }
                Ok(Box::new(step))
            })
            .register("passthrough", |spec| {
                let config: StepConfig = spec.options()?;
                Ok(Box::new(
                    Transform::<R>::new(config, Passthrough).with_kind("passthrough"),
                ))
            });
        registry
    }
}
