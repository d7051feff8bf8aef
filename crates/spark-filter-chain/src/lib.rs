#![deny(unsafe_code)]
#![doc = "spark-filter-chain: RPC 引擎底层的过滤器栈运行时。"]
#![doc = ""]
#![doc = "独立编写的过滤器（压缩、鉴权、重试等）以静态描述符的形式组成每通道一条的线性管线（通道栈），"]
#![doc = "每个在途调用在其上构建自己的调用栈：一次状态分配、按下标寻址、逐元素显式转发。"]

//! # 模块地图
//!
//! | 模块 | 职责 |
//! | --- | --- |
//! | [`filter`] | 过滤器描述符与默认回调 |
//! | [`layout`] | 尺寸计算、元素区段、状态视图 |
//! | [`channel_stack`] | 通道栈构建、通道操作、自省 |
//! | [`call_stack`] | 调用栈构建、批次派发、失败注入、拆除 |
//! | [`batch`] | 调用操作批次与通道操作 |
//! | [`refcount`] | 栈引用计数 |
//! | [`error`] | 错误码与错误类型 |
//! | [`config`] | 通道配置 |
//! | [`blackboard`] | 构建期只读共享上下文 |
//! | [`combiner`] / [`arena`] / [`runtime`] / [`telemetry`] | 外部协作者契约与参考实现 |
//!
//! # 快速上手
//! ```
//! use std::sync::Arc;
//!
//! use spark_filter_chain::{
//!     CallStack, CallStackArgs, ChannelStackBuilder, SerialCombiner, filter::FilterDescriptor,
//! };
//!
//! static TRANSPORT: FilterDescriptor = FilterDescriptor::new("transport").with_call_data_size(8);
//!
//! let channel = ChannelStackBuilder::new("client").filter(&TRANSPORT).build()?;
//! let call = CallStack::init(&channel, CallStackArgs::new(Arc::new(SerialCombiner::new())))
//!     .map_err(|failure| failure.error)?;
//! assert_eq!(call.state_bytes(), channel.call_stack_size());
//! # Ok::<(), spark_filter_chain::StackError>(())
//! ```

pub mod arena;
pub mod batch;
pub mod blackboard;
pub mod call_stack;
pub mod channel_stack;
pub mod combiner;
pub mod config;
pub mod error;
pub mod filter;
pub mod layout;
pub mod refcount;
pub mod runtime;
pub mod telemetry;
pub mod test_stubs;

mod sync;

pub use arena::{ArenaSlot, CallArena};
pub use batch::{
    BatchCallback, BatchState, ChannelInfo, Metadata, OpDirection, PollingEntity, StreamOpBatch,
    TransportOp,
};
pub use blackboard::Blackboard;
pub use call_stack::{
    CallElement, CallElementHandle, CallFinalInfo, CallInitFailure, CallStack, CallStackArgs,
    CallStackRef, TeardownCompletion,
};
pub use channel_stack::{
    ChannelElement, ChannelStack, ChannelStackBuilder, ChannelStackRef, filter_instance_number,
};
pub use combiner::{CallCombiner, SerialCombiner};
pub use config::{ArgValue, ChannelArgs};
pub use error::{FilterError, StackError, StatusCode, codes};
pub use filter::{CallElementArgs, ChannelElementArgs, FilterDescriptor};
pub use layout::{CallData, ChannelData, ElementState, call_stack_size, channel_stack_size};
pub use refcount::StackRefcount;
pub use runtime::{EventEngine, InlineEventEngine, StatsSink};
pub use telemetry::{DataSink, DataSource, DataSourceId, StackSnapshot, TelemetryRegistry};
