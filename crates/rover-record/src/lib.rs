//! # Rover Record
//!
//! 流水线数据单元定义（无线程、无 IO 依赖）
//!
//! ## 模块
//!
//! - `value`: 字段值类型 [`Value`]
//! - `frame`: 通用记录实现 [`Frame`]
//!
//! ## Record 契约
//!
//! 流水线核心只依赖 [`Record`] trait 的最小接口：序号、时间戳、克隆和字段合并。
//! 字段内容对流水线核心透明，具体含义由上层（相机、传感器、执行器）约定。
//!
//! ```text
//! Producer (驱动/解码器)
//!     ↓ Record (index, timestamp, fields)
//! Pipeline Steps (Merge / Split / Transform / Aligner)
//!     ↓ Record
//! Consumer
//! ```

pub mod frame;
pub mod value;

pub use frame::Frame;
pub use value::{Value, ValueError};

/// 速率字段名（records/s，由速率统计步骤写入）
pub const FIELD_RATE: &str = "rate";

/// 丢帧计数字段名（序号间隙累计）
pub const FIELD_DROPPED: &str = "dropped";

/// 流水线记录契约
///
/// # 不变量
///
/// - 同一个生产者输出的 `index()` 与 `timestamp()` 单调不减
/// - 不同生产者之间 **没有** 任何顺序或时钟关系保证
///
/// # 时间戳
///
/// `timestamp()` 为纳秒精度，来自生产者本地时钟。
pub trait Record: Clone + Send + 'static {
    /// 序号（生产者内单调递增）
    fn index(&self) -> i64;

    /// 时间戳（纳秒，生产者本地时钟）
    fn timestamp(&self) -> i64;

    /// 设置序号
    fn set_index(&mut self, index: i64);

    /// 设置时间戳
    fn set_timestamp(&mut self, timestamp: i64);

    /// 合并另一条记录
    ///
    /// 将 `other` 的字段写入 `self`，键冲突时以 `other` 为准；
    /// 同时采用 `other` 的序号和时间戳。
    fn copy_from(&mut self, other: &Self);

    /// 读取字段
    fn field(&self, key: &str) -> Option<&Value>;

    /// 写入字段（覆盖同名字段）
    fn set_field(&mut self, key: &str, value: Value);

    /// 写入速率字段
    fn set_rate(&mut self, rate: f64) {
        self.set_field(FIELD_RATE, Value::Float(rate));
    }

    /// 写入丢帧计数字段
    fn set_dropped(&mut self, dropped: u64) {
        self.set_field(FIELD_DROPPED, Value::Int(i64::try_from(dropped).unwrap_or(i64::MAX)));
    }
}
