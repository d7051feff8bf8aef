//! 通道共享的执行与度量设施。
//!
//! # 设计背景（Why）
//! - 通道栈持有“异步执行基底”与“度量登记处”的句柄，供该通道上的所有调用共享；
//! - 运行时本身不是调度器，只在需要把工作移出当前栈帧时（例如调用内存的最终释放）交给 [`EventEngine`]。

use std::time::Duration;

use crate::error::StatusCode;

/// 事件引擎任务。
pub type EngineTask = Box<dyn FnOnce() + Send + 'static>;

/// 异步执行基底的最小抽象。
pub trait EventEngine: Send + Sync {
    /// 执行（或安排执行）一个任务。
    fn run(&self, task: EngineTask);
}

/// 在调用线程上立即执行任务的事件引擎，作为默认值。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineEventEngine;

impl EventEngine for InlineEventEngine {
    fn run(&self, task: EngineTask) {
        task();
    }
}

/// 调用级度量的接收端。
///
/// # 契约（What）
/// - `call_started` 在调用栈初始化完成后触发（无论是否有过滤器初始化失败）；
/// - `call_finished` 在调用内存释放时触发，`elapsed` 为自调用开始时间起的耗时；
/// - 实现必须是非阻塞的，调用可能发生在任意线程。
pub trait StatsSink: Send + Sync {
    /// 记录调用开始。
    fn call_started(&self, stack: &str);
    /// 记录调用结束。
    fn call_finished(&self, stack: &str, status: StatusCode, elapsed: Duration);
}
