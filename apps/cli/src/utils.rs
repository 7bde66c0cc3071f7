//! 运行期辅助函数
//!
//! Ctrl-C 处理、终端输出的消费与指标打印。

use anyhow::{Context as _, Result};
use rover_pipeline::{Context, MetricsSnapshot, QueueReceiver};
use rover_record::Frame;
use tracing::info;

/// 收到 Ctrl-C 时取消 `ctx`
///
/// 每个进程只能安装一次。
pub fn install_ctrlc(ctx: &Context) -> Result<()> {
    let ctx = ctx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl-C received, cancelling pipeline");
        ctx.cancel();
    })
    .context("failed to install Ctrl-C handler")
}

/// 读空队列直到其关闭，返回读到的记录数
pub fn drain<F>(rx: QueueReceiver<Frame>, mut inspect: F) -> u64
where
    F: FnMut(&Frame),
{
    let mut count = 0;
    for frame in rx.iter() {
        inspect(&frame);
        count += 1;
    }
    count
}

/// 打印每个步骤的指标
pub fn print_metrics(rows: &[(String, MetricsSnapshot)]) {
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(4).max(4);
    println!(
        "  {:<width$}  {:>10}  {:>10}  {:>10}  {:>8}  {:>8}",
        "step",
        "received",
        "sent",
        "dropped",
        "errors",
        "drop %",
        width = width
    );
    for (name, m) in rows {
        println!(
            "  {:<width$}  {:>10}  {:>10}  {:>10}  {:>8}  {:>7.2}%",
            name,
            m.received,
            m.sent,
            m.dropped,
            m.errors,
            m.drop_rate(),
            width = width
        );
    }
}
