//! 取消测试
//!
//! 验证上下文取消能在任何阻塞点上终止整条流水线：
//! 1. 生产者永不关闭时，取消后所有步骤退出，所有输出队列关闭
//! 2. 阻塞发送（下游无人读取）被取消唤醒
//! 3. 带截止时间的子上下文到期后自动终止流水线

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError};
use rover_pipeline::{
    Aligner, AlignerConfig, Context, Merge, MergeConfig, Passthrough, Pipeline, QueueReceiver,
    QueueSender, Split, SplitConfig, Step, StepConfig, Transform, make_queue,
};
use rover_record::Frame;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// 排空队列并确认其已关闭
fn assert_closed(name: &str, out: &QueueReceiver<Frame>) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match out.recv_timeout(Duration::from_millis(100)) {
            Ok(_) => {},
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                assert!(Instant::now() < deadline, "output of '{}' still open", name);
            },
        }
    }
}

/// 持续生产记录，直到队列关闭或 `stop` 置位
fn spawn_producer(
    tx: QueueSender<Frame>,
    period: Duration,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let start = Instant::now();
        let mut index = 0;
        while !stop.load(Ordering::Relaxed) {
            let ts = start.elapsed().as_nanos() as i64;
            let sent = tx.send_timeout(Frame::new(index, ts), Duration::from_millis(50));
            if let Err(SendTimeoutError::Disconnected(_)) = sent {
                break;
            }
            index += 1;
            thread::sleep(period);
        }
    })
}

#[test]
fn test_cancel_stops_whole_pipeline() {
    let mut pipeline = Pipeline::new();
    let merge = pipeline
        .add_step(Merge::<Frame>::new(MergeConfig {
            step: StepConfig::named("merge"),
            ..MergeConfig::default()
        }))
        .unwrap();
    let split = pipeline
        .add_step(Split::<Frame>::new(SplitConfig::with_outputs(
            StepConfig::named("split"),
            2,
        )))
        .unwrap();
    let left = pipeline
        .add_step(Transform::new(StepConfig::named("left"), Passthrough))
        .unwrap();
    let right = pipeline
        .add_step(Transform::new(StepConfig::named("right"), Passthrough))
        .unwrap();
    let align = pipeline
        .add_step(Aligner::new(AlignerConfig {
            step: StepConfig::named("align").with_capacity(2),
            ..AlignerConfig::default()
        }))
        .unwrap();
    pipeline.connect_chain(&[merge, split, left, align]).unwrap();
    pipeline.connect_chain(&[right, align]).unwrap();
    pipeline.connect_steps(split, right).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for _ in 0..2 {
        let (tx, rx) = make_queue(8).unwrap();
        pipeline.attach_input(merge, rx).unwrap();
        producers.push(spawn_producer(tx, Duration::from_millis(1), stop.clone()));
    }
    pipeline.reset().unwrap();

    // 对齐输出无人读取：Aligner 最终阻塞在发送上
    let outputs: Vec<(String, QueueReceiver<Frame>)> = [merge, split, left, right, align]
        .into_iter()
        .map(|id| {
            let name = pipeline.get_step(id).unwrap().name().to_string();
            (name, pipeline.output(id).unwrap())
        })
        .collect();

    let ctx = Context::new();
    let canceller = ctx.clone();
    let cancel_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel();
    });

    let start = Instant::now();
    pipeline.run(&ctx).unwrap();
    let elapsed = start.elapsed();
    cancel_thread.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for p in producers {
        p.join().unwrap();
    }

    assert!(elapsed < Duration::from_secs(3), "pipeline took {:?} to stop", elapsed);
    for (name, out) in outputs.iter() {
        assert_closed(name, out);
    }
    assert!(pipeline.metrics().iter().any(|(_, m)| m.received > 0));
}

#[test]
fn test_cancel_unblocks_blocking_send() {
    let mut step: Transform<Frame> =
        Transform::new(StepConfig::named("stuck").with_capacity(1), Passthrough);
    let (tx, rx) = make_queue(8).unwrap();
    step.connect(rx).unwrap();
    step.reset().unwrap();
    let out = step.output().unwrap();

    for i in 0..4 {
        tx.send(Frame::new(i, i)).unwrap();
    }

    let ctx = Context::new();
    let runner_ctx = ctx.clone();
    let handle = thread::spawn(move || {
        step.run(&runner_ctx);
        step
    });

    // 第二条记录阻塞在满队列上
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());

    ctx.cancel();
    let step = handle.join().unwrap();
    let snapshot = step.metrics().snapshot();
    assert_eq!(snapshot.sent, 1);
    assert_eq!(snapshot.errors, 0);
    assert_closed("stuck", &out);
    drop(tx);
}

#[test]
fn test_deadline_context_stops_pipeline() {
    let mut pipeline = Pipeline::new();
    let merge = pipeline
        .add_step(Merge::<Frame>::new(MergeConfig::default()))
        .unwrap();
    let (_tx, rx) = make_queue(1).unwrap();
    pipeline.attach_input(merge, rx).unwrap();
    pipeline.reset().unwrap();
    let out = pipeline.output(merge).unwrap();

    let root = Context::new();
    let ctx = root.with_timeout(Duration::from_millis(100));
    let start = Instant::now();
    pipeline.run(&ctx).unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!root.is_cancelled());
    assert_closed("merge", &out);
}
