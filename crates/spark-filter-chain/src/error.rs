//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 过滤器栈只会遇到两类可恢复故障：构建期某个过滤器初始化失败、调用期某个过滤器向批次注入错误；
//!   二者都需要稳定错误码与调用状态码，便于上层把失败呈现为“通道创建失败”或“调用状态”。
//! - 资源生命周期误用（重复销毁、销毁后访问、引用计数下溢）属于编程错误，直接 `panic`，不在此建模。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`；
//! - 错误码遵循 `<领域>.<语义>` 约定，集中在 [`codes`]；
//! - [`FilterError`] 必须可克隆：一次失败要扇出到批次上的每个完成回调。

use std::borrow::Cow;

use serde::Serialize;
use thiserror::Error;

/// 稳定错误码集合。
///
/// # 契约说明（What）
/// - 码值一经发布不得修改语义；新增语义请追加常量。
pub mod codes {
    /// 过滤器在 `init_channel` 阶段失败。
    pub const CHANNEL_INIT_FAILED: &str = "filter.channel_init_failed";
    /// 过滤器在 `init_call` 阶段失败。
    pub const CALL_INIT_FAILED: &str = "filter.call_init_failed";
    /// 构建通道栈时未提供任何过滤器。
    pub const STACK_EMPTY: &str = "stack.empty";
    /// 过滤器主动向在途批次注入的失败。
    pub const BATCH_FAILED: &str = "call.batch_failed";
    /// 调用被取消。
    pub const CALL_CANCELLED: &str = "call.cancelled";
    /// 调用截止时间已过。
    pub const DEADLINE_EXCEEDED: &str = "call.deadline_exceeded";
    /// 传输层不可用或正在关闭。
    pub const TRANSPORT_UNAVAILABLE: &str = "transport.unavailable";
    /// 过滤器内部错误。
    pub const FILTER_INTERNAL: &str = "filter.internal";
}

/// 调用最终状态码，语义与主流 RPC 状态码保持一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[non_exhaustive]
pub enum StatusCode {
    /// 成功。
    Ok,
    /// 被调用方或对端取消。
    Cancelled,
    /// 未知错误，亦用于“调用结束时从未观测到状态”。
    Unknown,
    /// 参数非法。
    InvalidArgument,
    /// 截止时间已过。
    DeadlineExceeded,
    /// 目标不存在。
    NotFound,
    /// 权限不足。
    PermissionDenied,
    /// 资源耗尽。
    ResourceExhausted,
    /// 前置条件不满足。
    FailedPrecondition,
    /// 操作被中止。
    Aborted,
    /// 内部错误。
    Internal,
    /// 服务不可用。
    Unavailable,
    /// 未认证。
    Unauthenticated,
}

impl StatusCode {
    /// 是否为成功状态。
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

/// 过滤器报告的结构化错误。
///
/// # 教案式说明
/// - **意图（Why）**：初始化失败与批次失败都由过滤器产生，需要同时携带稳定错误码（供日志与告警聚合）
///   与调用状态码（供调用方呈现）。
/// - **契约（What）**：
///   - `code`：`'static` 稳定错误码，推荐取自 [`codes`]；
///   - `status`：映射到调用状态的 [`StatusCode`]；
///   - `message`：面向排障人员的描述，不得包含敏感信息。
/// - **权衡（Trade-offs）**：`Clone` 让一次失败可以投递给批次上的所有完成回调，代价是动态消息会被复制。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code} ({status:?}): {message}")]
pub struct FilterError {
    code: &'static str,
    status: StatusCode,
    message: Cow<'static, str>,
}

impl FilterError {
    /// 构造过滤器错误。
    pub fn new(
        code: &'static str,
        status: StatusCode,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }

    /// 以 [`StatusCode::Cancelled`] 构造取消错误。
    pub fn cancelled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CALL_CANCELLED, StatusCode::Cancelled, message)
    }

    /// 以 [`StatusCode::Unavailable`] 构造传输不可用错误。
    pub fn unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            codes::TRANSPORT_UNAVAILABLE,
            StatusCode::Unavailable,
            message,
        )
    }

    /// 以 [`StatusCode::Internal`] 构造内部错误。
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::FILTER_INTERNAL, StatusCode::Internal, message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 调用状态码。
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// 错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 栈构建错误。
///
/// # 教案式说明
/// - **意图（Why）**：构建失败需要告诉调用方“哪个栈、哪个过滤器、第几个位置”失败，
///   以便通道创建方直接把它作为通道创建失败上报。
/// - **契约（What）**：
///   - `ChannelInit`：通道栈未被创建，之前已初始化的过滤器已按逆序销毁；
///   - `CallInit`：调用栈结构完整存在，由调用方释放引用以触发正常销毁流程；
///   - `EmptyFilterList`：通道栈至少需要一个（贴近传输层的）过滤器。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StackError {
    /// 过滤器列表为空。
    #[error("channel stack `{stack}` requires at least one filter")]
    EmptyFilterList {
        /// 栈调试名。
        stack: String,
    },
    /// 通道级初始化失败。
    #[error("filter `{filter}` (#{index}) failed to initialise channel stack `{stack}`: {source}")]
    ChannelInit {
        /// 栈调试名。
        stack: String,
        /// 失败过滤器名称。
        filter: &'static str,
        /// 失败过滤器在栈中的位置。
        index: usize,
        /// 过滤器报告的原因。
        source: FilterError,
    },
    /// 调用级初始化失败。
    #[error("filter `{filter}` (#{index}) failed to initialise a call on `{stack}`: {source}")]
    CallInit {
        /// 所属通道栈调试名。
        stack: String,
        /// 失败过滤器名称。
        filter: &'static str,
        /// 失败过滤器在栈中的位置。
        index: usize,
        /// 过滤器报告的原因。
        source: FilterError,
    },
}

impl StackError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StackError::EmptyFilterList { .. } => codes::STACK_EMPTY,
            StackError::ChannelInit { .. } => codes::CHANNEL_INIT_FAILED,
            StackError::CallInit { .. } => codes::CALL_INIT_FAILED,
        }
    }

    /// 面向调用方的状态码；初始化失败沿用过滤器给出的状态。
    pub fn status(&self) -> StatusCode {
        match self {
            StackError::EmptyFilterList { .. } => StatusCode::InvalidArgument,
            StackError::ChannelInit { source, .. } | StackError::CallInit { source, .. } => {
                source.status()
            }
        }
    }

    /// 过滤器给出的底层错误。
    pub fn filter_error(&self) -> Option<&FilterError> {
        match self {
            StackError::EmptyFilterList { .. } => None,
            StackError::ChannelInit { source, .. } | StackError::CallInit { source, .. } => {
                Some(source)
            }
        }
    }
}
