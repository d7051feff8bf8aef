//! 每调用同步句柄。
//!
//! # 设计背景（Why）
//! - 同一调用的操作可能来自不同线程（应用发起批次、传输回调完成），而过滤器要求“对同一调用，
//!   自己的调用操作处理函数永不并发执行”；
//! - 运行时本身不是调度器，只约定所有调用级回调都经由 [`CallCombiner`] 投递，由它负责串行化。
//!
//! # 契约说明（What）
//! - `start` 可从任意线程、任意上下文调用，包括正在执行的合并器任务内部（重入时任务排队）；
//! - 任务按提交顺序执行，且任意时刻至多一个任务在运行。

use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tracing::{trace, warn};

/// 合并器任务。
pub type CombinerTask = Box<dyn FnOnce() + Send + 'static>;

/// 每调用串行化句柄的抽象。
pub trait CallCombiner: Send + Sync {
    /// 提交任务；`reason` 仅用于诊断日志。
    fn start(&self, task: CombinerTask, reason: &'static str);
}

/// 参考实现：先到者执行、后到者排队的串行合并器。
///
/// # 教案式说明
/// - **意图（Why）**：为测试与没有自有调度设施的嵌入方提供一个正确、无阻塞的串行化实现。
/// - **逻辑（How）**：
///   1. 任务先入队，再对 `pending` 做 `fetch_add`；
///   2. 若旧值为 0，当前线程成为“持有者”，循环出队执行，直到 `fetch_sub` 表明没有剩余任务；
///   3. 否则直接返回，任务由当前持有者在其循环中执行。
/// - **契约（What）**：入队总是先于计数递增，因此持有者观察到剩余计数时队列中一定有任务。
/// - **权衡（Trade-offs）**：持有者线程会顺带执行其他线程提交的任务，单次 `start` 的耗时不可预估；
///   需要低延迟的嵌入方应提供基于执行器的实现。
#[derive(Default)]
pub struct SerialCombiner {
    pending: AtomicUsize,
    queue: Mutex<VecDeque<CombinerTask>>,
}

impl SerialCombiner {
    /// 构造空合并器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前尚未执行完的任务数（含正在运行的任务）。
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl CallCombiner for SerialCombiner {
    fn start(&self, task: CombinerTask, reason: &'static str) {
        self.queue.lock().push_back(task);
        if self.pending.fetch_add(1, Ordering::AcqRel) > 0 {
            trace!(reason, "call combiner busy, task queued");
            return;
        }
        trace!(reason, "call combiner acquired");
        loop {
            // 计数只在入队之后递增，持有者观察到剩余计数时队列中必有任务。
            let Some(task) = self.queue.lock().pop_front() else {
                unreachable!("call combiner counted a task that was never queued");
            };
            let guard = RunningTask {
                combiner: self,
                finished: false,
            };
            task();
            if guard.finish() == 1 {
                break;
            }
        }
    }
}

/// 正在执行的合并器任务。
///
/// 任务正常返回时由 [`RunningTask::finish`] 归还计数；任务 panic 时 `Drop` 归还计数并丢弃
/// 排队中的任务，合并器回到空闲状态，之后的 `start` 不会被永久挂起。
struct RunningTask<'a> {
    combiner: &'a SerialCombiner,
    finished: bool,
}

impl RunningTask<'_> {
    fn finish(mut self) -> usize {
        self.finished = true;
        self.combiner.pending.fetch_sub(1, Ordering::AcqRel)
    }
}

impl Drop for RunningTask<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pending = &self.combiner.pending;
        let mut discarded = 0usize;
        if pending.fetch_sub(1, Ordering::AcqRel) > 1 {
            loop {
                let task = self.combiner.queue.lock().pop_front();
                if let Some(task) = task {
                    drop(task);
                    discarded += 1;
                    if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        break;
                    }
                }
            }
        }
        warn!(discarded, "call combiner task panicked, queued tasks discarded");
    }
}

impl fmt::Debug for SerialCombiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialCombiner")
            .field("pending", &self.pending())
            .finish()
    }
}
