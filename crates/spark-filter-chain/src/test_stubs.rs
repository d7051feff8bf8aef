//! 协作者的记录型测试桩。
//!
//! # 设计定位（Why）
//! - 集成测试与基准需要满足 [`TelemetryRegistry`]、[`StatsSink`]、[`EventEngine`] 契约，
//!   并断言“何时登记、何时结束、何时释放”；
//! - 集中在此提供，避免各测试文件重复定义，接口变化时也只需改一处。
//!
//! # 契约说明（What）
//! - 仅用于测试与示例；所有记录都保存在内存中，不做容量限制。

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::StatusCode,
    runtime::{EngineTask, EventEngine, StatsSink},
    telemetry::{DataSource, DataSourceId, StackSnapshot, TelemetryRegistry},
};

/// 记录登记与注销的数据源登记处。
#[derive(Default)]
pub struct RecordingRegistry {
    next_id: AtomicU64,
    sources: Mutex<BTreeMap<DataSourceId, Weak<dyn DataSource>>>,
    unregistered: Mutex<Vec<DataSourceId>>,
}

impl RecordingRegistry {
    /// 构造空登记处。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前登记的数据源数量。
    pub fn registered(&self) -> usize {
        self.sources.lock().len()
    }

    /// 已注销的编号。
    pub fn unregistered(&self) -> Vec<DataSourceId> {
        self.unregistered.lock().clone()
    }

    /// 采集所有仍存活的数据源。
    pub fn collect(&self) -> Vec<StackSnapshot> {
        let sources: Vec<_> = self.sources.lock().values().cloned().collect();
        let mut snapshots = Vec::new();
        for source in sources.iter().filter_map(Weak::upgrade) {
            source.add_data(&mut snapshots);
        }
        snapshots
    }
}

impl TelemetryRegistry for RecordingRegistry {
    fn register(&self, source: Weak<dyn DataSource>) -> DataSourceId {
        let id = DataSourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sources.lock().insert(id, source);
        id
    }

    fn unregister(&self, id: DataSourceId) {
        let removed = self.sources.lock().remove(&id);
        assert!(removed.is_some(), "data source {id:?} unregistered twice");
        self.unregistered.lock().push(id);
    }
}

/// 一次调用的统计记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedCall {
    /// 通道栈名称。
    pub stack: String,
    /// 最终状态。
    pub status: StatusCode,
    /// 耗时。
    pub elapsed: Duration,
}

/// 记录调用开始与结束的统计接收端。
#[derive(Debug, Default)]
pub struct RecordingStats {
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<FinishedCall>>,
}

impl RecordingStats {
    /// 构造空记录。
    pub fn new() -> Self {
        Self::default()
    }

    /// 已开始的调用（按栈名）。
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// 已结束的调用。
    pub fn finished(&self) -> Vec<FinishedCall> {
        self.finished.lock().clone()
    }
}

impl StatsSink for RecordingStats {
    fn call_started(&self, stack: &str) {
        self.started.lock().push(stack.to_owned());
    }

    fn call_finished(&self, stack: &str, status: StatusCode, elapsed: Duration) {
        self.finished.lock().push(FinishedCall {
            stack: stack.to_owned(),
            status,
            elapsed,
        });
    }
}

/// 只排队、由测试手动驱动的事件引擎。
#[derive(Default)]
pub struct DeferredEventEngine {
    tasks: Mutex<VecDeque<EngineTask>>,
}

impl DeferredEventEngine {
    /// 构造空引擎。
    pub fn new() -> Self {
        Self::default()
    }

    /// 排队中的任务数量。
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// 依次执行排队任务（含执行期间新入队的），返回执行数量。
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl EventEngine for DeferredEventEngine {
    fn run(&self, task: EngineTask) {
        self.tasks.lock().push_back(task);
    }
}
