//! 通用记录实现
//!
//! [`Frame`] 是 [`Record`] 的默认实现：序号 + 时间戳 + 有序字段表。
//! 适用于传感器帧、执行器状态等需要在步骤之间传递的小型结构化数据。

use crate::{Record, Value};
use std::collections::BTreeMap;

/// 通用记录（序号、时间戳、字段表）
///
/// # Example
///
/// ```
/// use rover_record::{Frame, Record, Value};
///
/// let frame = Frame::new(3, 1_000_000)
///     .with_field("camera", "left")
///     .with_field("exposure_us", 800i64);
///
/// assert_eq!(frame.index(), 3);
/// assert_eq!(frame.timestamp(), 1_000_000);
/// assert_eq!(frame.field("camera"), Some(&Value::from("left")));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// 序号
    pub index: i64,
    /// 时间戳（纳秒）
    pub timestamp: i64,
    /// 字段表
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: BTreeMap<String, Value>,
}

impl Frame {
    /// 创建空字段的记录
    pub fn new(index: i64, timestamp: i64) -> Self {
        Self {
            index,
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// 从字段表创建记录（序号和时间戳为 0）
    ///
    /// 用于构造 Transform 的静态字段模板。
    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self {
            index: 0,
            timestamp: 0,
            fields,
        }
    }

    /// 添加字段（构建器风格）
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// 删除字段，返回旧值
    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// 字段数量
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Record for Frame {
    fn index(&self) -> i64 {
        self.index
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn set_index(&mut self, index: i64) {
        self.index = index;
    }

    fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    fn copy_from(&mut self, other: &Self) {
        self.index = other.index;
        self.timestamp = other.timestamp;
        for (key, value) in other.fields.iter() {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    fn set_field(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }
}
