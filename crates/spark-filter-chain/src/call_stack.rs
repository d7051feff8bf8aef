//! 调用栈：与通道栈一一对应的调用级元素及其独占状态。
//!
//! # 设计背景（Why）
//! - 每个调用只做一次状态分配，尺寸直接取通道栈构建期缓存的值，元素之间以下标与区段切分寻址；
//! - 调用级元素对通道级状态只持有“按下标关联”的非拥有引用，通道的存活由调用栈对整个通道栈的强引用保证。
//!
//! # 生命周期（How）
//! 1. [`CallStack::init`]：分配 → 正向逐元素 `init_call`；某个过滤器失败不会中断循环，
//!    结构完整的栈随首个错误一起交还调用方；
//! 2. [`CallStackRef::start_batch`]：经调用合并器把批次派发给元素 0，过滤器用 [`CallElement::forward`]
//!    逐个转发；
//! 3. 最后一个 [`CallStackRef`] 释放：逆序 `destroy_call`，栈尾元素拿到 [`TeardownCompletion`]；
//!    销毁轮结束且拆除信号完成后，才在事件引擎上释放内存、通知统计、调用销毁回调并放开对通道栈的引用。
//!
//! # 并发契约（What）
//! - 调用状态访问使用 `try_lock`：争用意味着同一调用的两个操作被并发执行，属于致命误用；
//! - 批次回调应经由 [`CallCombiner`] 投递，不得在持有调用状态的栈帧内同步回调再入。

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    arena::CallArena,
    batch::{Metadata, PollingEntity, StreamOpBatch},
    channel_stack::{
        ChannelElement, ChannelStack, ChannelStackRef, DEFAULT_UNREF_REASON, StackDestroyCallback,
    },
    combiner::CallCombiner,
    error::{FilterError, StackError, StatusCode},
    filter::{CallElementArgs, FilterDescriptor, ServerTransportData},
    layout::{CallData, ChannelData, ElementState, WORD_BYTES},
    refcount::StackRefcount,
};

const CALL_STACK_OBJECT: &str = "call_stack";

/// 调用栈。
///
/// 引用计数必须是首字段，与 [`ChannelStack`] 保持同样的布局约束。
#[repr(C)]
pub struct CallStack {
    refcount: StackRefcount,
    count: usize,
    state_bytes: usize,
    channel: Arc<ChannelStack>,
    channel_hold: Mutex<Option<ChannelStackRef>>,
    data: Mutex<Box<[u64]>>,
    this: Weak<CallStack>,
    combiner: Arc<dyn CallCombiner>,
    arena: Arc<CallArena>,
    deadline: Option<Instant>,
    start_time: Instant,
    server_transport_data: Option<ServerTransportData>,
    status_override: Mutex<Option<FilterError>>,
    observed_status: Mutex<Option<Result<(), FilterError>>>,
    settled: Mutex<Option<CallFinalInfo>>,
    on_destroy: Mutex<Option<StackDestroyCallback>>,
    release_pending: AtomicUsize,
    ops_started: AtomicBool,
    destroyed: AtomicBool,
}

const _: () = assert!(core::mem::offset_of!(CallStack, refcount) == 0);

/// 构建调用栈的参数。
pub struct CallStackArgs {
    combiner: Arc<dyn CallCombiner>,
    arena: Option<Arc<CallArena>>,
    deadline: Option<Instant>,
    start_time: Option<Instant>,
    server_transport_data: Option<ServerTransportData>,
    on_destroy: Option<StackDestroyCallback>,
}

impl CallStackArgs {
    /// 以调用合并器开始。
    pub fn new(combiner: Arc<dyn CallCombiner>) -> Self {
        Self {
            combiner,
            arena: None,
            deadline: None,
            start_time: None,
            server_transport_data: None,
            on_destroy: None,
        }
    }

    /// 使用调用方提供的 Arena；默认新建一个。
    pub fn with_arena(mut self, arena: Arc<CallArena>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 设置调用开始时间；默认取构建时刻。
    pub fn with_start_time(mut self, start_time: Instant) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// 附带服务端传输数据。
    pub fn with_server_transport_data(mut self, data: ServerTransportData) -> Self {
        self.server_transport_data = Some(data);
        self
    }

    /// 设置销毁回调，调用内存释放后恰好调用一次。
    pub fn on_destroy(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_destroy = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for CallStackArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStackArgs")
            .field("deadline", &self.deadline)
            .field("start_time", &self.start_time)
            .field("server_transport_data", &self.server_transport_data.is_some())
            .finish_non_exhaustive()
    }
}

/// 调用栈初始化失败：栈结构完整，释放 `stack` 即触发正常销毁流程。
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CallInitFailure {
    /// 已构建的调用栈。
    pub stack: CallStackRef,
    /// 首个失败过滤器给出的错误。
    #[source]
    pub error: StackError,
}

/// `destroy_call` 收到的收尾信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFinalInfo {
    /// 调用最终状态；从未观测到状态时为 [`StatusCode::Unknown`]。
    pub status: StatusCode,
    /// 失败时的错误。
    pub error: Option<FilterError>,
    /// 自调用开始的耗时。
    pub elapsed: Duration,
}

impl CallStack {
    /// 在通道栈上构建一个调用栈。
    ///
    /// # 教案式说明
    /// - **意图（Why）**：调用建立是热路径，只做一次状态分配，并保证无论初始化成败，栈都能被安全销毁。
    /// - **逻辑（How）**：
    ///   1. 取得对通道栈的强引用，分配恰好 `call_stack_size` 字节的零值状态；
    ///   2. 正向调用每个过滤器的 `init_call`，成功记为 `Initialized`、失败记为 `InitFailed`，失败不中断循环；
    ///   3. 通知统计接收端调用开始。
    /// - **契约（What）**：返回 `Err` 时调用方应尽快丢弃 [`CallInitFailure::stack`]，销毁流程会对全部元素
    ///   （包括失败者的零值状态）逆序执行 `destroy_call`。
    pub fn init(
        channel: &ChannelStackRef,
        args: CallStackArgs,
    ) -> Result<CallStackRef, CallInitFailure> {
        let CallStackArgs {
            combiner,
            arena,
            deadline,
            start_time,
            server_transport_data,
            on_destroy,
        } = args;
        let hold = channel.ref_with_reason(CALL_STACK_OBJECT);
        let words = channel.call_stack_size() / WORD_BYTES;

        let stack = Arc::new_cyclic(|this| CallStack {
            refcount: StackRefcount::new(1),
            count: channel.count(),
            state_bytes: words * WORD_BYTES,
            channel: Arc::clone(channel.shared()),
            channel_hold: Mutex::new(Some(hold)),
            data: Mutex::new(vec![0u64; words].into_boxed_slice()),
            this: this.clone(),
            combiner,
            arena: arena.unwrap_or_default(),
            deadline,
            start_time: start_time.unwrap_or_else(Instant::now),
            server_transport_data,
            status_override: Mutex::new(None),
            observed_status: Mutex::new(None),
            settled: Mutex::new(None),
            on_destroy: Mutex::new(on_destroy),
            release_pending: AtomicUsize::new(2),
            ops_started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        let stack = CallStackRef::adopt(stack);

        let failure = stack.init_elements();
        if let Some(stats) = stack.channel.stats() {
            stats.call_started(stack.channel.name());
        }
        match failure {
            None => {
                debug!(stack = %stack.channel.name(), bytes = stack.state_bytes, "call stack built");
                Ok(stack)
            }
            Some(error) => Err(CallInitFailure { stack, error }),
        }
    }

    fn init_elements(&self) -> Option<StackError> {
        let args = CallElementArgs {
            call_stack: self,
            server_transport_data: self.server_transport_data.as_ref(),
            start_time: self.start_time,
            deadline: self.deadline,
            arena: &self.arena,
            call_combiner: &self.combiner,
        };
        let mut data = self.lock_data("init_call");
        let mut first_failure = None;
        for index in 0..self.count {
            let mut elem = self.element_in(&mut data, index);
            match (elem.filter().init_call)(&mut elem, &args) {
                Ok(()) => elem.set_state(ElementState::Initialized),
                Err(source) => {
                    elem.set_state(ElementState::InitFailed);
                    warn!(
                        stack = %self.channel.name(),
                        filter = elem.filter().name,
                        index,
                        code = source.code(),
                        "init_call failed"
                    );
                    if first_failure.is_none() {
                        first_failure = Some(StackError::CallInit {
                            stack: self.channel.name().to_owned(),
                            filter: elem.filter().name,
                            index,
                            source,
                        });
                    }
                }
            }
        }
        first_failure
    }

    fn assert_live(&self, context: &'static str) {
        assert!(
            !self.is_destroyed(),
            "call on `{}` used after its last reference was released ({context})",
            self.channel.name()
        );
    }

    fn lock_data(&self, context: &'static str) -> MutexGuard<'_, Box<[u64]>> {
        match self.data.try_lock() {
            Some(guard) => guard,
            None => panic!(
                "concurrent access to call state on `{}` during {context}: \
                 call operations must be serialized by the call combiner",
                self.channel.name()
            ),
        }
    }

    fn element_in<'s>(&'s self, data: &'s mut [u64], index: usize) -> CallElement<'s> {
        let region = &self.channel.layout()[index].call_region;
        let tail = &mut data[region.start..];
        let (region, rest) = tail.split_at_mut(region.len());
        CallElement {
            stack: self,
            index,
            region,
            rest,
        }
    }

    /// 元素数量，恒等于通道栈元素数量。
    pub fn count(&self) -> usize {
        self.count
    }

    /// 后备状态内存的字节数，恒等于通道栈缓存的调用栈尺寸。
    pub fn state_bytes(&self) -> usize {
        self.state_bytes
    }

    /// 所属通道栈。
    pub fn channel_stack(&self) -> &ChannelStack {
        &self.channel
    }

    /// 按栈序遍历过滤器描述符。
    pub fn filters(&self) -> impl ExactSizeIterator<Item = &'static FilterDescriptor> + '_ {
        self.channel.filters()
    }

    /// 调用合并器。
    pub fn combiner(&self) -> &Arc<dyn CallCombiner> {
        &self.combiner
    }

    /// 调用级 Arena。
    pub fn arena(&self) -> &Arc<CallArena> {
        &self.arena
    }

    /// 截止时间。
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 调用开始时间。
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// 服务端传输数据。
    pub fn server_transport_data(&self) -> Option<&ServerTransportData> {
        self.server_transport_data.as_ref()
    }

    /// 引用计数。
    pub fn refcount(&self) -> &StackRefcount {
        &self.refcount
    }

    /// 当前引用数量。
    pub fn ref_count(&self) -> usize {
        self.refcount.get()
    }

    /// 是否已进入销毁流程。
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// 已注入、将覆盖上行状态的错误。
    pub fn status_override(&self) -> Option<FilterError> {
        self.status_override.lock().clone()
    }

    /// 以给定原因取得一个新引用。
    ///
    /// # Panics
    /// 调用栈的引用计数已归零。
    pub fn ref_with_reason(&self, reason: &'static str) -> CallStackRef {
        let stack = match self.this.upgrade() {
            Some(stack) => stack,
            None => panic!("call on `{}` referenced after release", self.channel.name()),
        };
        self.refcount.acquire(CALL_STACK_OBJECT, reason);
        CallStackRef::adopt(stack)
    }

    /// 记录上行状态覆盖；只保留第一个。
    fn record_status_override(&self, error: &FilterError) {
        let mut slot = self.status_override.lock();
        if slot.is_none() {
            trace!(stack = %self.channel.name(), code = error.code(), "status override recorded");
            *slot = Some(error.clone());
        }
    }

    /// 上行状态回调包装：注入过的错误覆盖传输层给出的任何结果（成功或其他错误），并记录最终状态。
    fn observe_trailing_status(
        &self,
        result: Result<Metadata, FilterError>,
    ) -> Result<Metadata, FilterError> {
        let result = match self.status_override() {
            Some(error) => Err(error),
            None => result,
        };
        *self.observed_status.lock() = Some(result.as_ref().map(|_| ()).map_err(Clone::clone));
        result
    }

    fn final_info(&self) -> CallFinalInfo {
        let observed = self.observed_status.lock().clone();
        let (status, error) = match observed {
            Some(Ok(())) => (StatusCode::Ok, None),
            Some(Err(error)) => (error.status(), Some(error)),
            None => match self.status_override() {
                Some(error) => (error.status(), Some(error)),
                None => (StatusCode::Unknown, None),
            },
        };
        CallFinalInfo {
            status,
            error,
            elapsed: self.start_time.elapsed(),
        }
    }

    fn dispatch_first(&self, batch: StreamOpBatch) {
        self.assert_live("start_call_op");
        let mut data = self.lock_data("start_call_op");
        let mut elem = self.element_in(&mut data, 0);
        elem.dispatch(batch);
    }

    fn destroy(this: &Arc<CallStack>) {
        if this.destroyed.swap(true, Ordering::AcqRel) {
            panic!("call on `{}` destroyed twice", this.channel.name());
        }
        let info = this.final_info();
        *this.settled.lock() = Some(info.clone());
        {
            let mut data = this.lock_data("destroy_call");
            let mut completion = Some(TeardownCompletion {
                stack: Some(Arc::clone(this)),
            });
            for index in (0..this.count).rev() {
                let mut elem = this.element_in(&mut data, index);
                let completion = if elem.is_last() { completion.take() } else { None };
                (elem.filter().destroy_call)(&mut elem, &info, completion);
                elem.set_state(ElementState::Destroyed);
            }
        }
        debug!(stack = %this.channel.name(), status = ?info.status, "call stack destroyed");
        CallStack::arrive_release(this);
    }

    /// 销毁轮与拆除信号各到达一次，第二次到达者安排内存释放。
    fn arrive_release(this: &Arc<CallStack>) {
        if this.release_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let stack = Arc::clone(this);
            this.channel
                .event_engine()
                .run(Box::new(move || stack.release_memory()));
        }
    }

    fn release_memory(&self) {
        let released = std::mem::take(&mut *self.data.lock()).len() * WORD_BYTES;
        let info = self.settled.lock().take().unwrap_or_else(|| self.final_info());
        if let Some(stats) = self.channel.stats() {
            stats.call_finished(self.channel.name(), info.status, info.elapsed);
        }
        debug!(stack = %self.channel.name(), released, "call stack memory released");
        let callback = self.on_destroy.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        let hold = self.channel_hold.lock().take();
        drop(hold);
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStack")
            .field("channel", &self.channel.name())
            .field("count", &self.count)
            .field("state_bytes", &self.state_bytes)
            .field("refs", &self.refcount.get())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// 调用级元素：（调用栈，下标，本元素区段，其后全部区段）。
///
/// # 教案式说明
/// - **意图（Why）**：过滤器在一次回调中需要同时读写自己的调用状态、读取对应的通道状态，
///   并能把批次交给下一个元素。
/// - **逻辑（How）**：本元素区段首字为元素头，其余为调用状态；`rest` 保存其后所有元素的区段，
///   [`CallElement::forward`] 只需按下一个元素的区段长度切分 `rest`，为 O(1) 操作。
/// - **契约（What）**：元素只在调用状态被独占期间存在；需要在异步续延中重新进入时使用 [`CallElement::handle`]。
pub struct CallElement<'a> {
    stack: &'a CallStack,
    index: usize,
    region: &'a mut [u64],
    rest: &'a mut [u64],
}

impl<'a> CallElement<'a> {
    /// 过滤器描述符。
    pub fn filter(&self) -> &'static FilterDescriptor {
        self.stack.channel.layout()[self.index].filter
    }

    /// 在栈中的位置。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 是否为栈尾（贴近传输层）。
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.stack.count
    }

    /// 所属调用栈。
    pub fn call_stack(&self) -> &'a CallStack {
        self.stack
    }

    /// 同下标的通道级元素。
    pub fn channel_element(&self) -> ChannelElement<'a> {
        self.stack.channel.element(self.index)
    }

    /// 本过滤器的通道状态（非拥有）。
    pub fn channel_data(&self) -> ChannelData<'a> {
        self.channel_element().channel_data()
    }

    /// 本过滤器的调用状态。
    pub fn call_data(&mut self) -> CallData<'_> {
        CallData::new(&mut self.region[1..])
    }

    /// 元素生命周期状态。
    pub fn state(&self) -> ElementState {
        ElementState::from_word(self.region[0])
    }

    fn set_state(&mut self, state: ElementState) {
        self.region[0] = state.to_word();
    }

    /// 调用合并器。
    pub fn combiner(&self) -> &'a Arc<dyn CallCombiner> {
        &self.stack.combiner
    }

    /// 调用级 Arena。
    pub fn arena(&self) -> &'a Arc<CallArena> {
        &self.stack.arena
    }

    /// 截止时间。
    pub fn deadline(&self) -> Option<Instant> {
        self.stack.deadline
    }

    /// 取得可跨越异步续延的元素句柄（持有一个调用栈引用）。
    pub fn handle(&self) -> CallElementHandle {
        CallElementHandle {
            stack: self.stack.ref_with_reason("element_handle"),
            index: self.index,
        }
    }

    /// 把批次交给下一个元素。
    ///
    /// # Panics
    /// 当前元素已是栈尾：栈尾过滤器必须自行消费批次。
    pub fn forward(&mut self, batch: StreamOpBatch) {
        let next_index = self.index + 1;
        assert!(
            next_index < self.stack.count,
            "filter `{}` forwarded a batch past the last element of `{}`",
            self.filter().name,
            self.stack.channel.name()
        );
        let len = self.stack.channel.layout()[next_index].call_region.len();
        let (region, rest) = self.rest.split_at_mut(len);
        let mut next = CallElement {
            stack: self.stack,
            index: next_index,
            region,
            rest,
        };
        next.dispatch(batch);
    }

    fn dispatch(&mut self, mut batch: StreamOpBatch) {
        batch.state_mut().advance(self.index, self.is_last());
        trace!(filter = self.filter().name, index = self.index, "dispatch batch");
        (self.filter().start_call_op)(self, batch);
    }

    /// 在本元素终止批次并注入错误。
    ///
    /// # 契约（What）
    /// - 批次上登记的每个回调恰好收到一次该错误（经调用合并器投递）；
    /// - 错误同时记为调用的上行状态覆盖：即便此前已下发的批次稍后以成功完成 `recv_trailing_metadata`，
    ///   该回调观察到的也是这个错误。
    pub fn fail_batch(&mut self, mut batch: StreamOpBatch, error: FilterError) {
        batch.state_mut().fail(self.index);
        trace!(
            filter = self.filter().name,
            index = self.index,
            code = error.code(),
            "batch failed"
        );
        self.stack.record_status_override(&error);
        batch.finish_with_failure(&error, self.stack.combiner.as_ref());
    }

    /// 不经批次、直接向上行状态注入错误。
    pub fn inject_error(&self, error: FilterError) {
        self.stack.record_status_override(&error);
    }
}

impl fmt::Debug for CallElement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallElement")
            .field("stack", &self.stack.channel.name())
            .field("index", &self.index)
            .field("filter", &self.filter().name)
            .field("state", &self.state())
            .finish()
    }
}

/// 可跨越异步续延的元素句柄：（调用栈强引用，下标）。
#[derive(Clone, Debug)]
pub struct CallElementHandle {
    stack: CallStackRef,
    index: usize,
}

impl CallElementHandle {
    /// 元素下标。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 所属调用栈。
    pub fn call_stack(&self) -> &CallStackRef {
        &self.stack
    }

    /// 在当前线程独占进入元素；必须处于调用合并器任务中。
    pub fn with<R>(&self, f: impl FnOnce(&mut CallElement<'_>) -> R) -> R {
        self.stack.with_element(self.index, f)
    }

    /// 经调用合并器安排一次进入。
    pub fn schedule(
        &self,
        reason: &'static str,
        f: impl FnOnce(&mut CallElement<'_>) + Send + 'static,
    ) {
        let handle = self.clone();
        self.stack
            .combiner
            .start(Box::new(move || handle.with(f)), reason);
    }

    /// 向上行状态注入错误。
    pub fn inject_error(&self, error: FilterError) {
        self.stack.record_status_override(&error);
    }
}

/// 栈尾过滤器拆除完成信号。
///
/// # 教案式说明
/// - **意图（Why）**：栈尾过滤器的拆除可能需要传输层异步配合（例如冲刷缓冲帧），调用内存必须等它完成后才能回收。
/// - **契约（What）**：
///   - 只交给栈尾元素的 `destroy_call`，接收者必须最终调用 [`TeardownCompletion::complete`]；
///   - 未完成即被丢弃会记录 `warn!` 并视为完成，避免调用内存永久泄漏。
pub struct TeardownCompletion {
    stack: Option<Arc<CallStack>>,
}

impl TeardownCompletion {
    /// 报告拆除完成。
    pub fn complete(mut self) {
        if let Some(stack) = self.stack.take() {
            CallStack::arrive_release(&stack);
        }
    }
}

impl Drop for TeardownCompletion {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            warn!(
                stack = %stack.channel.name(),
                "teardown completion dropped without complete(), releasing call anyway"
            );
            CallStack::arrive_release(&stack);
        }
    }
}

impl fmt::Debug for TeardownCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownCompletion")
            .field("pending", &self.stack.is_some())
            .finish()
    }
}

/// 调用栈的共享所有权句柄；最后一个句柄释放时执行销毁流程。
pub struct CallStackRef {
    stack: Arc<CallStack>,
    drop_reason: &'static str,
}

impl CallStackRef {
    fn adopt(stack: Arc<CallStack>) -> Self {
        Self {
            stack,
            drop_reason: DEFAULT_UNREF_REASON,
        }
    }

    /// 以给定原因释放本引用。
    pub fn unref_with_reason(mut self, reason: &'static str) {
        self.drop_reason = reason;
        drop(self);
    }

    /// 两个句柄是否指向同一个调用栈。
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.stack, &b.stack)
    }

    /// 发起一个调用操作批次。
    ///
    /// # 教案式说明
    /// - **逻辑（How）**：
    ///   1. 若批次携带 `recv_trailing_metadata`，包裹它：注入过的错误覆盖成功结果，并记录最终状态；
    ///      包裹只持有 `Weak`，被传输层暂存的回调不会让调用栈自我延寿；
    ///   2. 取得一个调用栈引用，经调用合并器把批次派发给元素 0。
    /// - **契约（What）**：本方法本身不执行任何过滤器代码，可从任意线程调用。
    pub fn start_batch(&self, mut batch: StreamOpBatch) {
        self.assert_live("start_batch");
        self.ops_started.store(true, Ordering::Release);
        if let Some(callback) = batch.recv_trailing_metadata.take() {
            let stack = Weak::clone(&self.this);
            batch.recv_trailing_metadata = Some(Box::new(move |result| {
                let result = match stack.upgrade() {
                    Some(stack) => stack.observe_trailing_status(result),
                    None => result,
                };
                callback(result);
            }));
        }
        let holder = self.ref_with_reason("start_batch");
        self.combiner.start(
            Box::new(move || holder.dispatch_first(batch)),
            "call_stack.start_batch",
        );
    }

    /// 为全部过滤器绑定轮询实体。
    ///
    /// # Panics
    /// 已经发起过批次。
    pub fn set_polling_entity(&self, entity: PollingEntity) {
        assert!(
            !self.ops_started.load(Ordering::Acquire),
            "polling entity must be set on call `{}` before its first batch",
            self.channel.name()
        );
        self.assert_live("set_polling_entity");
        let mut data = self.lock_data("set_polling_entity");
        for index in 0..self.count {
            let mut elem = self.element_in(&mut data, index);
            (elem.filter().set_polling_entity)(&mut elem, &entity);
        }
    }

    /// 独占进入第 `index` 个元素。
    ///
    /// # Panics
    /// 下标越界，或调用状态正被其他操作占用。
    pub fn with_element<R>(&self, index: usize, f: impl FnOnce(&mut CallElement<'_>) -> R) -> R {
        assert!(
            index < self.count,
            "element {index} out of range for call on `{}` with {} elements",
            self.channel.name(),
            self.count
        );
        self.assert_live("with_element");
        let mut data = self.lock_data("with_element");
        let mut elem = self.element_in(&mut data, index);
        f(&mut elem)
    }

    /// 不经批次、直接向上行状态注入错误（例如应用侧取消）。
    pub fn inject_error(&self, error: FilterError) {
        self.record_status_override(&error);
    }
}

impl Clone for CallStackRef {
    fn clone(&self) -> Self {
        self.stack.ref_with_reason("clone")
    }
}

impl Drop for CallStackRef {
    fn drop(&mut self) {
        if self.stack.refcount.release(CALL_STACK_OBJECT, self.drop_reason) {
            CallStack::destroy(&self.stack);
        }
    }
}

impl Deref for CallStackRef {
    type Target = CallStack;

    fn deref(&self) -> &CallStack {
        &self.stack
    }
}

impl fmt::Debug for CallStackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.stack, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tracing_test::traced_test;

    use super::*;
    use crate::{channel_stack::ChannelStackBuilder, combiner::SerialCombiner};

    fn forget_completion(
        _elem: &mut CallElement<'_>,
        _info: &CallFinalInfo,
        completion: Option<TeardownCompletion>,
    ) {
        drop(completion);
    }

    static FORGETFUL: FilterDescriptor = FilterDescriptor::new("forgetful")
        .with_call_data_size(8)
        .with_destroy_call(forget_completion);

    #[test]
    #[traced_test]
    fn dropped_teardown_completion_still_releases_the_call() {
        let channel = ChannelStackBuilder::new("forgetful")
            .filter(&FORGETFUL)
            .build()
            .expect("构建必须成功");
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let call = CallStack::init(
            &channel,
            CallStackArgs::new(Arc::new(SerialCombiner::new())).on_destroy(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("调用初始化必须成功");

        drop(call);
        assert_eq!(released.load(Ordering::SeqCst), 1, "被丢弃的拆除信号视为完成");
        assert_eq!(channel.ref_count(), 1);
        assert!(logs_contain("teardown completion dropped without complete()"));
    }

    #[test]
    fn first_override_wins_over_every_transport_result() {
        let channel = ChannelStackBuilder::new("status")
            .filter(&FORGETFUL)
            .build()
            .expect("构建必须成功");
        let call = CallStack::init(&channel, CallStackArgs::new(Arc::new(SerialCombiner::new())))
            .expect("调用初始化必须成功");
        assert_eq!(call.final_info().status, StatusCode::Unknown);

        call.inject_error(FilterError::cancelled("first"));
        call.inject_error(FilterError::internal("second"));
        assert_eq!(call.final_info().status, StatusCode::Cancelled, "只保留第一个覆盖");

        let observed = call.observe_trailing_status(Ok(Metadata::new()));
        assert_eq!(observed.map_err(|error| error.status()), Err(StatusCode::Cancelled));
        let observed = call.observe_trailing_status(Err(FilterError::unavailable("transport gone")));
        assert_eq!(
            observed.map_err(|error| error.status()),
            Err(StatusCode::Cancelled),
            "传输层自身的错误同样不得替换已注入的错误"
        );
        let info = call.final_info();
        assert_eq!(info.status, StatusCode::Cancelled);
        assert_eq!(info.error.map(|error| error.message().to_owned()).as_deref(), Some("first"));
    }
}
