//! 栈自省数据源。
//!
//! # 设计背景（Why）
//! - 外部的观测子系统（类似 channelz 的在线诊断页）需要在不持有通道的前提下按需读取栈的结构：
//!   过滤器名称、实例编号、状态尺寸与当前引用计数；
//! - 因此通道栈只登记一个 `Weak` 数据源：登记处不会延长栈的生命周期，栈销毁时主动注销。
//!
//! # 契约说明（What）
//! - 登记发生在 `post_init_channel` 全部完成之后，注销发生在 `destroy_channel` 之前；
//! - 快照类型实现 `Serialize`，可直接输出为 JSON。

use std::sync::Weak;

use serde::Serialize;

/// 登记处分配的数据源编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DataSourceId(pub u64);

/// 单个过滤器元素的快照。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilterSnapshot {
    /// 在栈中的位置。
    pub index: usize,
    /// 过滤器名称。
    pub name: &'static str,
    /// 同一描述符在其之前出现的次数。
    pub instance: usize,
    /// 调用状态字节数（未对齐）。
    pub call_data_size: usize,
    /// 通道状态字节数（未对齐）。
    pub channel_data_size: usize,
}

/// 通道栈快照。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackSnapshot {
    /// 栈调试名。
    pub name: String,
    /// 当前引用计数。
    pub ref_count: usize,
    /// 每个调用栈的状态字节数。
    pub call_stack_size: usize,
    /// 通道栈状态字节数。
    pub channel_stack_size: usize,
    /// 按栈序排列的过滤器。
    pub filters: Vec<FilterSnapshot>,
}

/// 快照的接收端。
pub trait DataSink {
    /// 追加一个栈快照。
    fn add_stack(&mut self, snapshot: StackSnapshot);
}

impl DataSink for Vec<StackSnapshot> {
    fn add_stack(&mut self, snapshot: StackSnapshot) {
        self.push(snapshot);
    }
}

/// 按需产出自省数据的对象。
pub trait DataSource: Send + Sync {
    /// 把当前状态写入 `sink`。
    fn add_data(&self, sink: &mut dyn DataSink);
}

/// 数据源登记处。
///
/// # 教案式说明
/// - **意图（Why）**：观测子系统决定何时采集，栈只负责在生命周期边界登记与注销。
/// - **契约（What）**：
///   - `register` 收到的是 `Weak`，实现不得将其升级后长期持有；
///   - 同一编号只会被 `unregister` 一次。
pub trait TelemetryRegistry: Send + Sync {
    /// 登记数据源。
    fn register(&self, source: Weak<dyn DataSource>) -> DataSourceId;
    /// 注销数据源。
    fn unregister(&self, id: DataSourceId);
}
