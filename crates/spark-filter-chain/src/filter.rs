//! 过滤器描述符。
//!
//! # 设计背景（Why）
//! - 过滤器由不同团队独立编写、互不知晓，运行时只能通过一份纯声明式的描述与之交互：
//!   两种状态尺寸、一组生命周期函数、两个操作入口、一个自省入口以及稳定名称；
//! - 以函数指针表而非 trait 对象表达，描述符可以是 `static` 常量，被所有通道共享而无需任何分配。
//!
//! # 契约说明（What）
//! - 描述符定义后不可变，不携带任何实例状态；实例状态只存在于栈内为其划出的区段中；
//! - 描述符身份以地址判定（`core::ptr::eq`），因此必须以 `static` 定义，不能以临时值或 `const` 复制；
//! - 运行时只在文档列出的生命周期节点回调过滤器。
//!
//! # 使用方式（How）
//! ```
//! use spark_filter_chain::filter::FilterDescriptor;
//!
//! static LOGGING: FilterDescriptor = FilterDescriptor::new("logging")
//!     .with_call_data_size(16)
//!     .with_channel_data_size(8);
//! assert_eq!(LOGGING.name, "logging");
//! ```

use std::{any::Any, fmt, sync::Arc, time::Instant};

use crate::{
    arena::CallArena,
    batch::{ChannelInfo, PollingEntity, StreamOpBatch, TransportOp},
    blackboard::Blackboard,
    call_stack::{CallElement, CallFinalInfo, CallStack, TeardownCompletion},
    channel_stack::{ChannelElement, ChannelStack},
    combiner::CallCombiner,
    config::ChannelArgs,
    error::FilterError,
};

/// 服务端传输为调用附带的不透明数据。
pub type ServerTransportData = Arc<dyn Any + Send + Sync>;

/// `init_channel` 的参数。
#[derive(Debug)]
pub struct ChannelElementArgs<'a> {
    /// 正在构建的通道栈。
    pub channel_stack: &'a ChannelStack,
    /// 通道配置。
    pub channel_args: &'a ChannelArgs,
    /// 是否为栈首元素。
    pub is_first: bool,
    /// 是否为栈尾（贴近传输层的）元素。
    pub is_last: bool,
    /// 构建期共享的只读黑板。
    pub blackboard: Option<&'a Blackboard>,
}

/// `init_call` 的参数。
pub struct CallElementArgs<'a> {
    /// 正在构建的调用栈。
    pub call_stack: &'a CallStack,
    /// 服务端传输附带的数据；客户端调用为 `None`。
    pub server_transport_data: Option<&'a ServerTransportData>,
    /// 调用开始时间。
    pub start_time: Instant,
    /// 调用截止时间。
    pub deadline: Option<Instant>,
    /// 调用级对象 Arena。
    pub arena: &'a Arc<CallArena>,
    /// 调用合并器。
    pub call_combiner: &'a Arc<dyn CallCombiner>,
}

impl fmt::Debug for CallElementArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallElementArgs")
            .field("server_transport_data", &self.server_transport_data.is_some())
            .field("start_time", &self.start_time)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// `init_channel` 回调。
pub type InitChannelFn = fn(ChannelElement<'_>, &ChannelElementArgs<'_>) -> Result<(), FilterError>;
/// `post_init_channel` 回调。
pub type PostInitChannelFn = fn(&ChannelStack, ChannelElement<'_>);
/// `destroy_channel` 回调。
pub type DestroyChannelFn = fn(ChannelElement<'_>);
/// `init_call` 回调。
pub type InitCallFn = fn(&mut CallElement<'_>, &CallElementArgs<'_>) -> Result<(), FilterError>;
/// `set_polling_entity` 回调。
pub type SetPollingEntityFn = fn(&mut CallElement<'_>, &PollingEntity);
/// `destroy_call` 回调。
pub type DestroyCallFn = fn(&mut CallElement<'_>, &CallFinalInfo, Option<TeardownCompletion>);
/// 调用操作入口。
pub type StartCallOpFn = fn(&mut CallElement<'_>, StreamOpBatch);
/// 通道操作入口。
pub type StartChannelOpFn = fn(ChannelElement<'_>, TransportOp);
/// 自省入口。
pub type GetChannelInfoFn = fn(ChannelElement<'_>, &mut ChannelInfo);

/// 单个过滤器的不可变描述。
///
/// # 教案式说明
/// - **意图（Why）**：让运行时在不了解过滤器实现的前提下完成尺寸计算、初始化、转发与销毁。
/// - **逻辑（How）**：`new` 以透传/空操作默认值填满全部回调，过滤器作者用 `with_*` 只覆盖关心的入口，
///   整个构造过程是 `const` 的，结果可直接放进 `static`。
/// - **契约（What）**：
///   - `init_call` 拿到的是零值状态，失败时不得破坏兄弟过滤器状态；`destroy_call` 必须接受零值状态；
///   - `destroy_call` 只有在栈尾元素上才会收到 [`TeardownCompletion`]，收到者必须最终调用 `complete`；
///   - `post_init_channel` 只在所有 `init_channel` 成功后运行，且不可失败；
///   - 非栈尾过滤器的 `start_call_op` 通过 [`CallElement::forward`] 显式转发，运行时不做隐式串联。
pub struct FilterDescriptor {
    /// 稳定名称，用于日志与自省。
    pub name: &'static str,
    /// 每个调用的状态字节数。
    pub call_data_size: usize,
    /// 每个通道的状态字节数。
    pub channel_data_size: usize,
    /// 初始化通道状态。
    pub init_channel: InitChannelFn,
    /// 全部 `init_channel` 成功后的第二阶段初始化。
    pub post_init_channel: PostInitChannelFn,
    /// 销毁通道状态。
    pub destroy_channel: DestroyChannelFn,
    /// 初始化调用状态。
    pub init_call: InitCallFn,
    /// 绑定轮询实体。
    pub set_polling_entity: SetPollingEntityFn,
    /// 销毁调用状态。
    pub destroy_call: DestroyCallFn,
    /// 处理调用操作批次。
    pub start_call_op: StartCallOpFn,
    /// 处理通道操作。
    pub start_channel_op: StartChannelOpFn,
    /// 填充通道信息。
    pub get_channel_info: GetChannelInfoFn,
}

impl FilterDescriptor {
    /// 以透传默认值构造描述符。
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            call_data_size: 0,
            channel_data_size: 0,
            init_channel: no_init_channel,
            post_init_channel: no_post_init,
            destroy_channel: no_destroy_channel,
            init_call: no_init_call,
            set_polling_entity: ignore_polling_entity,
            destroy_call: default_destroy_call,
            start_call_op: next_call_op,
            start_channel_op: next_channel_op,
            get_channel_info: next_get_info,
        }
    }

    /// 设置调用状态字节数。
    pub const fn with_call_data_size(self, call_data_size: usize) -> Self {
        Self {
            call_data_size,
            ..self
        }
    }

    /// 设置通道状态字节数。
    pub const fn with_channel_data_size(self, channel_data_size: usize) -> Self {
        Self {
            channel_data_size,
            ..self
        }
    }

    /// 覆盖 `init_channel`。
    pub const fn with_init_channel(self, init_channel: InitChannelFn) -> Self {
        Self {
            init_channel,
            ..self
        }
    }

    /// 覆盖 `post_init_channel`。
    pub const fn with_post_init_channel(self, post_init_channel: PostInitChannelFn) -> Self {
        Self {
            post_init_channel,
            ..self
        }
    }

    /// 覆盖 `destroy_channel`。
    pub const fn with_destroy_channel(self, destroy_channel: DestroyChannelFn) -> Self {
        Self {
            destroy_channel,
            ..self
        }
    }

    /// 覆盖 `init_call`。
    pub const fn with_init_call(self, init_call: InitCallFn) -> Self {
        Self { init_call, ..self }
    }

    /// 覆盖 `set_polling_entity`。
    pub const fn with_set_polling_entity(self, set_polling_entity: SetPollingEntityFn) -> Self {
        Self {
            set_polling_entity,
            ..self
        }
    }

    /// 覆盖 `destroy_call`。
    pub const fn with_destroy_call(self, destroy_call: DestroyCallFn) -> Self {
        Self {
            destroy_call,
            ..self
        }
    }

    /// 覆盖调用操作入口。
    pub const fn with_start_call_op(self, start_call_op: StartCallOpFn) -> Self {
        Self {
            start_call_op,
            ..self
        }
    }

    /// 覆盖通道操作入口。
    pub const fn with_start_channel_op(self, start_channel_op: StartChannelOpFn) -> Self {
        Self {
            start_channel_op,
            ..self
        }
    }

    /// 覆盖自省入口。
    pub const fn with_get_channel_info(self, get_channel_info: GetChannelInfoFn) -> Self {
        Self {
            get_channel_info,
            ..self
        }
    }

    /// 两个描述符是否为同一个 `static`。
    pub fn same_as(&self, other: &FilterDescriptor) -> bool {
        core::ptr::eq(self, other)
    }
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("name", &self.name)
            .field("call_data_size", &self.call_data_size)
            .field("channel_data_size", &self.channel_data_size)
            .finish_non_exhaustive()
    }
}

/// 不需要通道状态初始化的过滤器使用。
pub fn no_init_channel(
    _elem: ChannelElement<'_>,
    _args: &ChannelElementArgs<'_>,
) -> Result<(), FilterError> {
    Ok(())
}

/// 不需要第二阶段初始化的过滤器使用。
pub fn no_post_init(_stack: &ChannelStack, _elem: ChannelElement<'_>) {}

/// 通道状态无需清理的过滤器使用。
pub fn no_destroy_channel(_elem: ChannelElement<'_>) {}

/// 不需要调用状态初始化的过滤器使用。
pub fn no_init_call(
    _elem: &mut CallElement<'_>,
    _args: &CallElementArgs<'_>,
) -> Result<(), FilterError> {
    Ok(())
}

/// 调用状态无需清理的过滤器使用；若位于栈尾，立即完成拆除信号。
pub fn default_destroy_call(
    _elem: &mut CallElement<'_>,
    _info: &CallFinalInfo,
    completion: Option<TeardownCompletion>,
) {
    if let Some(completion) = completion {
        completion.complete();
    }
}

/// 不关心轮询实体的过滤器使用。
pub fn ignore_polling_entity(_elem: &mut CallElement<'_>, _entity: &PollingEntity) {}

/// 原样转发调用操作批次。
pub fn next_call_op(elem: &mut CallElement<'_>, batch: StreamOpBatch) {
    elem.forward(batch);
}

/// 沿操作方向原样转发通道操作。
pub fn next_channel_op(elem: ChannelElement<'_>, op: TransportOp) {
    elem.forward_op(op);
}

/// 把 `get_info` 交给下一个元素。
pub fn next_get_info(elem: ChannelElement<'_>, info: &mut ChannelInfo) {
    elem.next_get_info(info);
}
