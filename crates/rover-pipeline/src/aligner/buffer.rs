//! 单源对齐缓冲区
//!
//! 按到达顺序保存同一来源的记录（时间戳单调不减），支持最近时间戳查找与按数量/时间裁剪。

use rover_record::Record;
use std::collections::VecDeque;

/// 单源对齐缓冲区
#[derive(Debug, Clone)]
pub struct AlignBuffer<R> {
    entries: VecDeque<R>,
}

impl<R> Default for AlignBuffer<R> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<R: Record> AlignBuffer<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预分配容量
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// 追加一条记录（最新）
    pub fn add(&mut self, record: R) {
        self.entries.push_back(record);
    }

    /// 弹出最旧的记录
    pub fn pop(&mut self) -> Option<R> {
        self.entries.pop_front()
    }

    /// 只保留最新的 `keep` 条记录
    pub fn prune(&mut self, keep: usize) {
        let excess = self.entries.len().saturating_sub(keep);
        self.entries.drain(..excess);
    }

    /// 移除时间戳早于 `timestamp` 的记录
    pub fn prune_older_than(&mut self, timestamp: i64) {
        while self
            .entries
            .front()
            .is_some_and(|r| r.timestamp() < timestamp)
        {
            self.entries.pop_front();
        }
    }

    /// 移除位置 `position` 及之前的所有记录
    pub fn drain_through(&mut self, position: usize) {
        let end = (position + 1).min(self.entries.len());
        self.entries.drain(..end);
    }

    /// 查找时间戳最接近 `timestamp` 的记录
    ///
    /// 返回 `(位置, 时间戳)`；距离相同时取较早的记录。缓冲区为空时返回 `None`。
    pub fn find_closest(&self, timestamp: i64) -> Option<(usize, i64)> {
        let mut best: Option<(usize, i64, u64)> = None;
        for (pos, record) in self.entries.iter().enumerate() {
            let ts = record.timestamp();
            let distance = ts.abs_diff(timestamp);
            match best {
                Some((_, _, d)) if distance >= d => {},
                _ => best = Some((pos, ts, distance)),
            }
        }
        best.map(|(pos, ts, _)| (pos, ts))
    }

    pub fn get(&self, position: usize) -> Option<&R> {
        self.entries.get(position)
    }

    /// 最新的记录
    pub fn newest(&self) -> Option<&R> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.entries.iter()
    }
}
