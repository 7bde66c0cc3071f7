//! 流水线图
//!
//! [`Pipeline`] 持有一组步骤和它们之间的连线，负责统一的 reset / run。
//!
//! # 连线
//!
//! 连线只在 [`Pipeline::reset`] 时真正生效：`reset()` 会重新分配每个步骤的输出队列，
//! 因此每次 reset 都按拓扑顺序重建所有连接：
//!
//! 1. 断开所有步骤的上游
//! 2. 按拓扑顺序处理每个步骤：按声明顺序连接它的所有上游（外部输入或上游步骤的输出端口），
//!    然后 reset 它
//!
//! 多输入步骤（Merge / Aligner）的输入序号因此等于连线的声明顺序。
//!
//! # 运行
//!
//! [`Pipeline::run`] 为每个步骤启动一个作用域线程，所有步骤返回后才返回。

use crate::config::PipelineSpec;
use crate::context::Context;
use crate::error::PipelineError;
use crate::metrics::MetricsSnapshot;
use crate::queue::QueueReceiver;
use crate::registry::Registry;
use crate::step::Step;
use rover_record::Record;
use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// 步骤 ID（在流水线内的序号）
pub type StepId = usize;

enum Upstream<R> {
    /// 上游步骤的输出端口
    Step { from: StepId, port: usize },
    /// 外部生产者
    External(QueueReceiver<R>),
}

struct Link<R> {
    upstream: Upstream<R>,
    to: StepId,
}

/// 流水线
pub struct Pipeline<R: Record> {
    steps: Vec<Box<dyn Step<R>>>,
    names: HashMap<String, StepId>,
    links: Vec<Link<R>>,
    /// 每个步骤下一个空闲的输出端口
    next_port: Vec<usize>,
    /// 外部输入名 → 步骤
    bindings: HashMap<String, StepId>,
    ready: bool,
}

impl<R: Record> Default for Pipeline<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Pipeline<R> {
    /// 创建空流水线
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            names: HashMap::new(),
            links: Vec::new(),
            next_port: Vec::new(),
            bindings: HashMap::new(),
            ready: false,
        }
    }

    /// 按描述和注册表构建流水线
    pub fn from_spec(spec: &PipelineSpec, registry: &Registry<R>) -> Result<Self, PipelineError> {
        spec.validate()?;
        let mut pipeline = Self::new();
        for step_spec in spec.steps.iter() {
            let step = registry.build(step_spec)?;
            pipeline.add_boxed_step(step)?;
        }
        for chain in spec.chains.iter() {
            let ids = chain
                .iter()
                .map(|name| pipeline.require(name))
                .collect::<Result<Vec<_>, _>>()?;
            pipeline.connect_chain(&ids)?;
        }
        for input in spec.inputs.iter() {
            let id = pipeline.require(&input.step)?;
            pipeline.bindings.insert(input.source.clone(), id);
        }
        debug!(
            "Pipeline built: {} steps, {} links",
            pipeline.steps.len(),
            pipeline.links.len()
        );
        Ok(pipeline)
    }

    pub fn from_json(s: &str, registry: &Registry<R>) -> Result<Self, PipelineError> {
        Self::from_spec(&PipelineSpec::from_json(s)?, registry)
    }

    pub fn from_toml(s: &str, registry: &Registry<R>) -> Result<Self, PipelineError> {
        Self::from_spec(&PipelineSpec::from_toml(s)?, registry)
    }

    /// 添加步骤（名称重复时失败）
    pub fn add_step<S: Step<R> + 'static>(&mut self, step: S) -> Result<StepId, PipelineError> {
        self.add_boxed_step(Box::new(step))
    }

    pub fn add_boxed_step(&mut self, step: Box<dyn Step<R>>) -> Result<StepId, PipelineError> {
        let name = step.name().to_string();
        if self.names.contains_key(&name) {
            return Err(PipelineError::DuplicateStep(name));
        }
        let id = self.steps.len();
        self.steps.push(step);
        self.next_port.push(0);
        self.names.insert(name, id);
        self.ready = false;
        Ok(id)
    }

    /// 添加步骤；同名步骤已存在时返回已有步骤的 ID（新步骤被丢弃）
    pub fn add_or_find_step<S: Step<R> + 'static>(&mut self, step: S) -> StepId {
        if let Some(id) = self.find_step(step.name()) {
            return id;
        }
        let id = self.steps.len();
        self.names.insert(step.name().to_string(), id);
        self.steps.push(Box::new(step));
        self.next_port.push(0);
        self.ready = false;
        id
    }

    pub fn get_step(&self, id: StepId) -> Option<&dyn Step<R>> {
        self.steps.get(id).map(|s| &**s)
    }

    pub fn get_step_mut(&mut self, id: StepId) -> Option<&mut (dyn Step<R> + 'static)> {
        self.ready = false;
        self.steps.get_mut(id).map(|s| &mut **s)
    }

    /// 按名称查找步骤 ID
    pub fn find_step(&self, name: &str) -> Option<StepId> {
        self.names.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<StepId, PipelineError> {
        self.find_step(name)
            .ok_or_else(|| PipelineError::StepNotFound(name.to_string()))
    }

    fn check(&self, id: StepId) -> Result<(), PipelineError> {
        if id < self.steps.len() {
            Ok(())
        } else {
            Err(PipelineError::StepNotFound(format!("#{}", id)))
        }
    }

    /// 连接两个步骤：`from` 的下一个空闲输出端口 → `to`
    pub fn connect_steps(&mut self, from: StepId, to: StepId) -> Result<(), PipelineError> {
        self.check(from)?;
        self.check(to)?;
        if from == to {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}' cannot feed itself",
                self.steps[from].name()
            )));
        }
        let port = self.next_port[from];
        if port >= self.steps[from].output_count() {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}' has no free output port ({} in use)",
                self.steps[from].name(),
                port
            )));
        }
        self.next_port[from] += 1;
        self.links.push(Link {
            upstream: Upstream::Step { from, port },
            to,
        });
        self.ready = false;
        Ok(())
    }

    pub fn connect_steps_by_name(&mut self, from: &str, to: &str) -> Result<(), PipelineError> {
        let from = self.require(from)?;
        let to = self.require(to)?;
        self.connect_steps(from, to)
    }

    /// 依次连接 `ids[0] → ids[1] → ...`
    pub fn connect_chain(&mut self, ids: &[StepId]) -> Result<(), PipelineError> {
        for pair in ids.windows(2) {
            self.connect_steps(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// 连接外部生产者的队列
    pub fn attach_input(&mut self, step: StepId, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        self.check(step)?;
        self.links.push(Link {
            upstream: Upstream::External(input),
            to: step,
        });
        self.ready = false;
        Ok(())
    }

    /// 按描述文件中的外部输入名连接队列
    pub fn bind_input(&mut self, source: &str, input: QueueReceiver<R>) -> Result<(), PipelineError> {
        let step = *self
            .bindings
            .get(source)
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown input source '{}'", source)))?;
        self.attach_input(step, input)
    }

    /// 描述文件中声明的外部输入名
    pub fn input_sources(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// 拓扑排序（有环时失败）
    fn topological_order(&self) -> Result<Vec<StepId>, PipelineError> {
        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut downstream: Vec<Vec<StepId>> = vec![Vec::new(); n];
        for link in self.links.iter() {
            if let Upstream::Step { from, .. } = link.upstream {
                in_degree[link.to] += 1;
                downstream[from].push(link.to);
            }
        }

        let mut queue: VecDeque<StepId> = (0..n).filter(|&id| in_degree[id] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in downstream[id].iter() {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            return Err(PipelineError::InvalidConfig(
                "pipeline graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// 重置所有步骤并重建连线
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        self.ready = false;
        let order = self.topological_order()?;
        for step in self.steps.iter_mut() {
            step.disconnect();
        }

        for id in order {
            for link in self.links.iter().filter(|l| l.to == id) {
                let input = match &link.upstream {
                    Upstream::Step { from, port } => {
                        let upstream = &self.steps[*from];
                        upstream.output_at(*port).ok_or_else(|| PipelineError::NotReset {
                            step: upstream.name().to_string(),
                        })?
                    },
                    Upstream::External(rx) => rx.clone(),
                };
                self.steps[id].connect(input)?;
            }
            self.steps[id].reset()?;
        }

        self.ready = true;
        Ok(())
    }

    /// 步骤的输出队列读端（端口 0）
    pub fn output(&self, id: StepId) -> Option<QueueReceiver<R>> {
        self.steps.get(id).and_then(|s| s.output())
    }

    /// 步骤指定端口的输出队列读端
    pub fn output_at(&self, id: StepId, port: usize) -> Option<QueueReceiver<R>> {
        self.steps.get(id).and_then(|s| s.output_at(port))
    }

    /// 没有连接下游的输出端口 `(步骤, 端口)`
    ///
    /// 这些端口需要由调用方消费，否则阻塞发送策略的步骤会在队列满后停住。
    pub fn unconnected_outputs(&self) -> Vec<(StepId, usize)> {
        self.steps
            .iter()
            .enumerate()
            .flat_map(|(id, step)| {
                (self.next_port[id]..step.output_count()).map(move |port| (id, port))
            })
            .collect()
    }

    /// 运行所有步骤，直到全部返回
    ///
    /// 必须先调用 [`reset`](Self::reset)；每次运行后需要重新 reset。
    pub fn run(&mut self, ctx: &Context) -> Result<(), PipelineError> {
        if !self.ready {
            return Err(PipelineError::NotReset {
                step: "pipeline".to_string(),
            });
        }
        self.ready = false;

        let start = Instant::now();
        info!("Pipeline started with {} steps", self.steps.len());
        thread::scope(|s| {
            for step in self.steps.iter_mut() {
                let name = step.name().to_string();
                let spawned = thread::Builder::new()
                    .name(format!("step-{}", name))
                    .spawn_scoped(s, move || step.run(ctx));
                if let Err(e) = spawned {
                    tracing::error!("{}: failed to spawn step thread: {}", name, e);
                    ctx.cancel();
                }
            }
        });
        info!("Pipeline stopped after {:?}", start.elapsed());

        for (name, snapshot) in self.metrics() {
            debug!(
                "{}: received={} sent={} dropped={} errors={}",
                name, snapshot.received, snapshot.sent, snapshot.dropped, snapshot.errors
            );
        }
        Ok(())
    }

    /// 各步骤的指标快照
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.steps
            .iter()
            .map(|s| (s.name().to_string(), s.metrics().snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 步骤名称（按添加顺序）
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Merge, MergeConfig};
    use crate::queue::make_queue;
    use crate::split::{Split, SplitConfig};
    use crate::step::StepConfig;
    use crate::transform::{Passthrough, Transform};
    use rover_record::Frame;

    fn passthrough(name: &str) -> Transform<Frame> {
        Transform::new(StepConfig::named(name), Passthrough)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut pipeline = Pipeline::new();
        pipeline.add_step(passthrough("a")).unwrap();
        assert!(matches!(
            pipeline.add_step(passthrough("a")),
            Err(PipelineError::DuplicateStep(_))
        ));
        assert_eq!(pipeline.add_or_find_step(passthrough("a")), 0);
        assert_eq!(pipeline.add_or_find_step(passthrough("b")), 1);
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_single_output_port() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_step(passthrough("a")).unwrap();
        let b = pipeline.add_step(passthrough("b")).unwrap();
        let c = pipeline.add_step(passthrough("c")).unwrap();
        pipeline.connect_steps(a, b).unwrap();
        assert!(matches!(
            pipeline.connect_steps(a, c),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_split_ports_are_assigned_in_order() {
        let mut pipeline = Pipeline::new();
        let split = pipeline
            .add_step(Split::<Frame>::new(SplitConfig::with_outputs(
                StepConfig::named("split"),
                2,
            )))
            .unwrap();
        let a = pipeline.add_step(passthrough("a")).unwrap();
        let b = pipeline.add_step(passthrough("b")).unwrap();
        pipeline.connect_steps(split, a).unwrap();
        assert_eq!(pipeline.unconnected_outputs(), vec![(split, 1), (a, 0), (b, 0)]);
        pipeline.connect_steps(split, b).unwrap();
        assert_eq!(pipeline.unconnected_outputs(), vec![(a, 0), (b, 0)]);

        let (tx, rx) = make_queue(4).unwrap();
        pipeline.attach_input(split, rx).unwrap();
        pipeline.reset().unwrap();

        let out_a = pipeline.output(a).unwrap();
        let out_b = pipeline.output(b).unwrap();
        tx.send(Frame::new(1, 1)).unwrap();
        drop(tx);
        pipeline.run(&Context::new()).unwrap();

        assert_eq!(out_a.iter().count(), 1);
        assert_eq!(out_b.iter().count(), 1);
    }

    #[test]
    fn test_cycle_rejected_at_reset() {
        let mut pipeline = Pipeline::new();
        let a = pipeline
            .add_step(Merge::<Frame>::new(MergeConfig::default()))
            .unwrap();
        let b = pipeline.add_step(passthrough("b")).unwrap();
        pipeline.connect_steps(a, b).unwrap();
        pipeline.connect_steps(b, a).unwrap();
        assert!(matches!(
            pipeline.reset(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dangling_step_fails_at_reset() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_step(passthrough("a")).unwrap();
        pipeline.add_step(passthrough("orphan")).unwrap();
        let (_tx, rx) = make_queue(1).unwrap();
        pipeline.attach_input(a, rx).unwrap();
        assert!(matches!(
            pipeline.reset(),
            Err(PipelineError::NotConnected { step }) if step == "orphan"
        ));
        assert!(pipeline.run(&Context::new()).is_err());
    }

    #[test]
    fn test_run_requires_reset() {
        let mut pipeline: Pipeline<Frame> = Pipeline::new();
        pipeline.add_step(passthrough("a")).unwrap();
        assert!(matches!(
            pipeline.run(&Context::new()),
            Err(PipelineError::NotReset { .. })
        ));
    }

    #[test]
    fn test_reset_rewires_after_run() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add_step(passthrough("a")).unwrap();
        let b = pipeline.add_step(passthrough("b")).unwrap();
        pipeline.connect_chain(&[a, b]).unwrap();

        for round in 0..2 {
            let (tx, rx) = make_queue(4).unwrap();
            pipeline.attach_input(a, rx).unwrap();
            pipeline.reset().unwrap();
            let out = pipeline.output(b).unwrap();

            tx.send(Frame::new(round, round)).unwrap();
            drop(tx);
            pipeline.run(&Context::new()).unwrap();

            let indices: Vec<i64> = out.iter().map(|f| f.index).collect();
            assert_eq!(indices, vec![round]);

            // 下一轮使用新的外部输入
            pipeline.links.retain(|l| !matches!(l.upstream, Upstream::External(_)));
        }
        assert!(pipeline.run(&Context::new()).is_err(), "run consumes the reset");
    }

    #[test]
    fn test_from_json_with_bound_input() {
        let registry = Registry::<Frame>::with_builtins();
        let mut pipeline = Pipeline::from_json(
            r#"{
                "steps": [
                    {"name": "stamp", "kind": "fields", "options": {"fields": {"robot": "rover-1"}}},
                    {"name": "fps", "kind": "rate"}
                ],
                "chains": [["stamp", "fps"]],
                "inputs": [{"step": "stamp", "source": "imu"}]
            }"#,
            &registry,
        )
        .unwrap();
        assert_eq!(pipeline.step_names().collect::<Vec<_>>(), vec!["stamp", "fps"]);

        let (tx, rx) = make_queue(4).unwrap();
        pipeline.bind_input("imu", rx).unwrap();
        assert!(pipeline.bind_input("lidar", make_queue(1).unwrap().1).is_err());
        pipeline.reset().unwrap();
        let out = pipeline.output(pipeline.find_step("fps").unwrap()).unwrap();

        tx.send(Frame::new(0, 0)).unwrap();
        drop(tx);
        pipeline.run(&Context::new()).unwrap();

        let frame = out.recv().unwrap();
        assert_eq!(frame.field("robot").and_then(|v| v.as_str()), Some("rover-1"));
        assert!(frame.field("rate").is_some());
    }
}
