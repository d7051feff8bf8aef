//! 调用操作批次与通道操作。
//!
//! # 设计背景（Why）
//! - 调用操作批次把“发送请求头 / 接收尾部元数据”等一组动作打包，自上而下逐元素转发；
//!   通道操作则是面向整个通道的控制信号（例如传输层即将关闭）；
//! - 两者都是“按值移动”的对象：每次转发都把所有权交给下一个元素，天然杜绝同一批次被派发两次。
//!
//! # 契约说明（What）
//! - 批次上的每个完成回调都是 `FnOnce`，最多被调用一次；
//! - 失败注入通过 [`StreamOpBatch::finish_with_failure`] 统一完成，所有已登记的回调都会观察到同一个错误；
//! - 批次回调总是经由调用合并器投递，而不是在过滤器栈帧内直接调用。

use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::{combiner::CallCombiner, error::FilterError};

/// 批次完成回调。
pub type BatchCallback<T> = Box<dyn FnOnce(Result<T, FilterError>) + Send + 'static>;

/// 有序元数据，键可重复。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// 构造空元数据。
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一项。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// 读取某键的第一个值。
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// 条目数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按插入顺序遍历。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// 批次在过滤器栈中的位置。
///
/// 状态迁移：`Created → Dispatched(i) → {Dispatched(i+1) | FailedHere(i) | DeliveredToTransport}`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchState {
    /// 尚未进入过滤器栈。
    #[default]
    Created,
    /// 已派发到第 `i` 个元素。
    Dispatched(usize),
    /// 第 `i` 个元素注入了失败。
    FailedHere(usize),
    /// 已到达最后一个（贴近传输层的）元素。
    DeliveredToTransport,
}

impl BatchState {
    fn position(self) -> Option<usize> {
        match self {
            BatchState::Created => None,
            BatchState::Dispatched(index) | BatchState::FailedHere(index) => Some(index),
            BatchState::DeliveredToTransport => Some(usize::MAX),
        }
    }

    pub(crate) fn advance(&mut self, index: usize, is_last: bool) {
        match *self {
            BatchState::FailedHere(at) => {
                panic!("batch failed at element {at} cannot be dispatched again to element {index}")
            }
            BatchState::DeliveredToTransport => {
                panic!("batch already delivered to the transport cannot be dispatched to element {index}")
            }
            _ => {}
        }
        if let Some(current) = self.position() {
            assert!(
                index > current,
                "batch dispatched to element {index} after element {current}: dispatch must move strictly forward"
            );
        }
        *self = if is_last {
            BatchState::DeliveredToTransport
        } else {
            BatchState::Dispatched(index)
        };
    }

    pub(crate) fn fail(&mut self, index: usize) {
        if let BatchState::FailedHere(at) = *self {
            panic!("batch already failed at element {at}, cannot fail again at element {index}");
        }
        *self = BatchState::FailedHere(index);
    }
}

/// 单次调用的一组操作。
///
/// # 教案式说明
/// - **意图（Why）**：把一次调用在某个时刻请求的动作打包，让过滤器可以按需改写（例如压缩 `send_message`、
///   为 `send_initial_metadata` 追加鉴权头）或包裹回调（例如在 `recv_trailing_metadata` 上统计状态）。
/// - **逻辑（How）**：发送类字段携带数据；接收类字段携带完成回调；`on_complete` 在整个批次完成时触发。
/// - **契约（What）**：
///   - 过滤器可以替换任意回调，但替换者必须保证被替换的回调最终恰好被调用一次；
///   - 批次只能向后派发，`state` 由运行时维护，过滤器只读。
#[derive(Default)]
pub struct StreamOpBatch {
    /// 待发送的初始元数据。
    pub send_initial_metadata: Option<Metadata>,
    /// 待发送的消息。
    pub send_message: Option<Bytes>,
    /// 待发送的尾部元数据。
    pub send_trailing_metadata: Option<Metadata>,
    /// 接收初始元数据的回调。
    pub recv_initial_metadata: Option<BatchCallback<Metadata>>,
    /// 接收消息的回调；`Ok(None)` 表示对端流已结束。
    pub recv_message: Option<BatchCallback<Option<Bytes>>>,
    /// 接收尾部元数据的回调，调用状态由它派生。
    pub recv_trailing_metadata: Option<BatchCallback<Metadata>>,
    /// 取消流并携带原因。
    pub cancel_stream: Option<FilterError>,
    /// 批次整体完成回调。
    pub on_complete: Option<BatchCallback<()>>,
    state: BatchState,
}

impl StreamOpBatch {
    /// 构造空批次。
    pub fn new() -> Self {
        Self::default()
    }

    /// 批次当前位置。
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut BatchState {
        &mut self.state
    }

    /// 已登记的回调数量。
    pub fn callback_count(&self) -> usize {
        usize::from(self.recv_initial_metadata.is_some())
            + usize::from(self.recv_message.is_some())
            + usize::from(self.recv_trailing_metadata.is_some())
            + usize::from(self.on_complete.is_some())
    }

    /// 以同一错误结束批次上的全部回调。
    ///
    /// # 契约（What）
    /// - 每个已登记回调恰好收到一次 `Err(error.clone())`；
    /// - 回调经由 `combiner` 投递，调用方此时仍持有调用状态的独占访问，直接调用会与回调中的再入访问冲突。
    pub fn finish_with_failure(self, error: &FilterError, combiner: &dyn CallCombiner) {
        let StreamOpBatch {
            recv_initial_metadata,
            recv_message,
            recv_trailing_metadata,
            on_complete,
            ..
        } = self;
        trace!(code = error.code(), "failing batch callbacks");
        if let Some(callback) = recv_initial_metadata {
            let error = error.clone();
            combiner.start(
                Box::new(move || callback(Err(error))),
                "batch.recv_initial_metadata.failed",
            );
        }
        if let Some(callback) = recv_message {
            let error = error.clone();
            combiner.start(
                Box::new(move || callback(Err(error))),
                "batch.recv_message.failed",
            );
        }
        if let Some(callback) = recv_trailing_metadata {
            let error = error.clone();
            combiner.start(
                Box::new(move || callback(Err(error))),
                "batch.recv_trailing_metadata.failed",
            );
        }
        if let Some(callback) = on_complete {
            let error = error.clone();
            combiner.start(
                Box::new(move || callback(Err(error))),
                "batch.on_complete.failed",
            );
        }
    }
}

impl fmt::Debug for StreamOpBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOpBatch")
            .field("send_initial_metadata", &self.send_initial_metadata)
            .field("send_message", &self.send_message.as_ref().map(Bytes::len))
            .field("send_trailing_metadata", &self.send_trailing_metadata)
            .field("recv_initial_metadata", &self.recv_initial_metadata.is_some())
            .field("recv_message", &self.recv_message.is_some())
            .field("recv_trailing_metadata", &self.recv_trailing_metadata.is_some())
            .field("cancel_stream", &self.cancel_stream)
            .field("on_complete", &self.on_complete.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// 通道操作的传播方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpDirection {
    /// 自应用侧向传输侧（元素 0 → 末元素）。
    Down,
    /// 自传输侧向应用侧（末元素 → 元素 0）。
    Up,
}

/// 面向整个通道的控制操作。
///
/// # 契约（What）
/// - `direction` 决定起点与转发方向；
/// - 操作离开栈的任一端即视为被消费，`on_consumed` 以 `Ok(())` 触发；
/// - 过滤器可以就地处理并调用 [`TransportOp::consume`] 提前结束传播。
pub struct TransportOp {
    /// 传播方向。
    pub direction: OpDirection,
    /// 通知对端不再接受新调用。
    pub goaway_error: Option<FilterError>,
    /// 立即断开连接。
    pub disconnect_with_error: Option<FilterError>,
    /// 发送 ping，回调在收到应答时触发。
    pub send_ping: Option<BatchCallback<()>>,
    /// 操作被消费时触发。
    pub on_consumed: Option<BatchCallback<()>>,
}

impl TransportOp {
    /// 构造向传输侧传播的空操作。
    pub fn downward() -> Self {
        Self::with_direction(OpDirection::Down)
    }

    /// 构造向应用侧传播的空操作。
    pub fn upward() -> Self {
        Self::with_direction(OpDirection::Up)
    }

    fn with_direction(direction: OpDirection) -> Self {
        Self {
            direction,
            goaway_error: None,
            disconnect_with_error: None,
            send_ping: None,
            on_consumed: None,
        }
    }

    /// 结束传播并通知发起方。
    pub fn consume(mut self) {
        if let Some(callback) = self.on_consumed.take() {
            callback(Ok(()));
        }
    }
}

impl fmt::Debug for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOp")
            .field("direction", &self.direction)
            .field("goaway_error", &self.goaway_error)
            .field("disconnect_with_error", &self.disconnect_with_error)
            .field("send_ping", &self.send_ping.is_some())
            .field("on_consumed", &self.on_consumed.is_some())
            .finish()
    }
}

/// `get_info` 遍历收集的通道信息。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// 负载均衡策略名称。
    pub lb_policy_name: Option<String>,
    /// 生效的服务配置（JSON 文本）。
    pub service_config_json: Option<String>,
}

/// 调用所绑定的轮询实体。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PollingEntity {
    /// 尚未绑定。
    #[default]
    None,
    /// 单个 pollset 的标识。
    Pollset(u64),
    /// pollset 集合的标识。
    PollsetSet(u64),
}
