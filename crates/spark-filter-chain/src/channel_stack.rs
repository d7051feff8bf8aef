//! 通道栈：按固定顺序排列的通道级元素及其共享状态。
//!
//! # 设计背景（Why）
//! - 通道可能存活整个进程周期、承载数百万调用，因此所有“每调用都要算一次”的东西（调用栈尺寸、
//!   元素区段）都在构建期一次算好并缓存；
//! - 过滤器之间互不知晓，跨过滤器的自省（例如实例编号）只能在所有过滤器都完成第一阶段初始化后进行，
//!   因此构建过程显式分为 `init_channel` 与 `post_init_channel` 两轮。
//!
//! # 生命周期（How）
//! 1. [`ChannelStackBuilder::build`]：计算尺寸 → 分配并清零状态 → 正向 `init_channel` →
//!    正向 `post_init_channel` → 登记自省数据源；
//! 2. 任意 `init_channel` 失败：已初始化者逆序 `destroy_channel`，返回 [`StackError::ChannelInit`]，
//!    栈对象不会逃逸给调用方；
//! 3. 最后一个 [`ChannelStackRef`] 释放：注销数据源 → 逆序 `destroy_channel` → 恰好一次调用销毁回调。
//!
//! # 契约（What）
//! - 元素顺序在构建后永不改变，基于它构建的每个调用栈顺序一致；
//! - 引用计数是唯一会被任意线程在构建/销毁之外修改的栈状态；
//! - 引用计数之后的任何访问（例如销毁后再取元素）是所有权纪律错误，直接 `panic`。

use std::{
    borrow::Cow,
    fmt,
    ops::Deref,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    batch::{ChannelInfo, OpDirection, TransportOp},
    blackboard::Blackboard,
    config::ChannelArgs,
    error::StackError,
    filter::{ChannelElementArgs, FilterDescriptor},
    layout::{self, ChannelData, ElementLayout, ElementState},
    refcount::StackRefcount,
    runtime::{EventEngine, InlineEventEngine, StatsSink},
    telemetry::{DataSink, DataSource, DataSourceId, FilterSnapshot, StackSnapshot, TelemetryRegistry},
};

/// 栈销毁回调。
pub type StackDestroyCallback = Box<dyn FnOnce() + Send + 'static>;

/// 未显式给出原因时，句柄释放记录的原因。
pub(crate) const DEFAULT_UNREF_REASON: &str = "smart_pointer";

/// 通道栈。
///
/// 引用计数必须是首字段：外部拿到的“引用计数地址”与“栈地址”可以互换。
#[repr(C)]
pub struct ChannelStack {
    refcount: StackRefcount,
    count: usize,
    call_stack_size: usize,
    channel_stack_size: usize,
    name: Cow<'static, str>,
    layout: Box<[ElementLayout]>,
    channel_data: Box<[AtomicU64]>,
    channel_args: ChannelArgs,
    blackboard: Option<Arc<Blackboard>>,
    event_engine: Arc<dyn EventEngine>,
    stats: Option<Arc<dyn StatsSink>>,
    telemetry: Option<Arc<dyn TelemetryRegistry>>,
    telemetry_id: OnceLock<DataSourceId>,
    on_destroy: Mutex<Option<StackDestroyCallback>>,
    destroyed: AtomicBool,
}

const _: () = assert!(core::mem::offset_of!(ChannelStack, refcount) == 0);

/// 通道栈构建器。
///
/// # 教案式说明
/// - **意图（Why）**：构建参数较多且大多可选（黑板、统计、自省登记处、销毁回调），
///   链式构建器让通道创建方只声明关心的部分。
/// - **契约（What）**：
///   - 过滤器顺序即调用时的转发顺序，最后一个过滤器应贴近传输层；
///   - 描述符必须是 `static`，实例编号以描述符地址判定身份；
///   - 未指定事件引擎时使用 [`InlineEventEngine`]。
pub struct ChannelStackBuilder {
    name: Cow<'static, str>,
    filters: Vec<&'static FilterDescriptor>,
    channel_args: ChannelArgs,
    blackboard: Option<Arc<Blackboard>>,
    event_engine: Arc<dyn EventEngine>,
    stats: Option<Arc<dyn StatsSink>>,
    telemetry: Option<Arc<dyn TelemetryRegistry>>,
    on_destroy: Option<StackDestroyCallback>,
}

impl ChannelStackBuilder {
    /// 以调试名开始构建。
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            channel_args: ChannelArgs::default(),
            blackboard: None,
            event_engine: Arc::new(InlineEventEngine),
            stats: None,
            telemetry: None,
            on_destroy: None,
        }
    }

    /// 追加一个过滤器。
    pub fn filter(mut self, filter: &'static FilterDescriptor) -> Self {
        self.filters.push(filter);
        self
    }

    /// 追加一组过滤器。
    pub fn filters(mut self, filters: impl IntoIterator<Item = &'static FilterDescriptor>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// 设置通道配置。
    pub fn channel_args(mut self, channel_args: ChannelArgs) -> Self {
        self.channel_args = channel_args;
        self
    }

    /// 设置只读黑板。
    pub fn blackboard(mut self, blackboard: Arc<Blackboard>) -> Self {
        self.blackboard = Some(blackboard);
        self
    }

    /// 设置事件引擎。
    pub fn event_engine(mut self, event_engine: Arc<dyn EventEngine>) -> Self {
        self.event_engine = event_engine;
        self
    }

    /// 设置调用级统计接收端。
    pub fn stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// 设置自省数据源登记处。
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryRegistry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// 设置销毁回调，最后一个引用释放时恰好调用一次。
    pub fn on_destroy(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_destroy = Some(Box::new(callback));
        self
    }

    /// 构建通道栈。
    ///
    /// # 错误
    /// - [`StackError::EmptyFilterList`]：未提供过滤器；
    /// - [`StackError::ChannelInit`]：某个过滤器 `init_channel` 失败，之前的过滤器已逆序销毁，
    ///   销毁回调不会被调用。
    pub fn build(self) -> Result<ChannelStackRef, StackError> {
        if self.filters.is_empty() {
            return Err(StackError::EmptyFilterList {
                stack: self.name.into_owned(),
            });
        }

        let call_stack_size = layout::call_stack_size(&self.filters);
        let channel_stack_size = layout::channel_stack_size(&self.filters);
        let (element_layout, channel_words, _) = layout::compute_layout(&self.filters);
        let channel_data = (0..channel_words).map(|_| AtomicU64::new(0)).collect();

        let stack = Arc::new(ChannelStack {
            refcount: StackRefcount::new(1),
            count: self.filters.len(),
            call_stack_size,
            channel_stack_size,
            name: self.name,
            layout: element_layout,
            channel_data,
            channel_args: self.channel_args,
            blackboard: self.blackboard,
            event_engine: self.event_engine,
            stats: self.stats,
            telemetry: self.telemetry,
            telemetry_id: OnceLock::new(),
            on_destroy: Mutex::new(self.on_destroy),
            destroyed: AtomicBool::new(false),
        });

        stack.init_elements()?;
        for index in 0..stack.count {
            let elem = stack.element_unchecked(index);
            (elem.filter().post_init_channel)(&stack, elem);
            elem.set_state(ElementState::Ready);
        }

        if let Some(registry) = &stack.telemetry {
            let source: Weak<ChannelStack> = Arc::downgrade(&stack);
            let source: Weak<dyn DataSource> = source;
            let id = registry.register(source);
            let _ = stack.telemetry_id.set(id);
        }

        debug!(
            stack = %stack.name,
            filters = stack.count,
            call_stack_size,
            channel_stack_size,
            "channel stack built"
        );
        Ok(ChannelStackRef::adopt(stack))
    }
}

impl fmt::Debug for ChannelStackBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStackBuilder")
            .field("name", &self.name)
            .field(
                "filters",
                &self.filters.iter().map(|filter| filter.name).collect::<Vec<_>>(),
            )
            .field("channel_args", &self.channel_args)
            .finish_non_exhaustive()
    }
}

impl ChannelStack {
    fn init_elements(&self) -> Result<(), StackError> {
        for index in 0..self.count {
            let elem = self.element_unchecked(index);
            let args = ChannelElementArgs {
                channel_stack: self,
                channel_args: &self.channel_args,
                is_first: index == 0,
                is_last: index + 1 == self.count,
                blackboard: self.blackboard.as_deref(),
            };
            if let Err(source) = (elem.filter().init_channel)(elem, &args) {
                warn!(
                    stack = %self.name,
                    filter = elem.filter().name,
                    index,
                    code = source.code(),
                    "init_channel failed, unwinding initialised filters"
                );
                for initialised in (0..index).rev() {
                    let elem = self.element_unchecked(initialised);
                    (elem.filter().destroy_channel)(elem);
                    elem.set_state(ElementState::Destroyed);
                }
                self.destroyed.store(true, Ordering::Release);
                return Err(StackError::ChannelInit {
                    stack: self.name.to_string(),
                    filter: elem.filter().name,
                    index,
                    source,
                });
            }
            elem.set_state(ElementState::Initialized);
        }
        Ok(())
    }

    /// 栈调试名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 元素数量。
    pub fn count(&self) -> usize {
        self.count
    }

    /// 每个调用栈需要的状态字节数（构建期缓存）。
    pub fn call_stack_size(&self) -> usize {
        self.call_stack_size
    }

    /// 通道栈状态字节数。
    pub fn channel_stack_size(&self) -> usize {
        self.channel_stack_size
    }

    /// 通道配置。
    pub fn channel_args(&self) -> &ChannelArgs {
        &self.channel_args
    }

    /// 构建期黑板。
    pub fn blackboard(&self) -> Option<&Arc<Blackboard>> {
        self.blackboard.as_ref()
    }

    /// 事件引擎。
    pub fn event_engine(&self) -> &Arc<dyn EventEngine> {
        &self.event_engine
    }

    /// 调用级统计接收端。
    pub fn stats(&self) -> Option<&Arc<dyn StatsSink>> {
        self.stats.as_ref()
    }

    /// 引用计数。
    pub fn refcount(&self) -> &StackRefcount {
        &self.refcount
    }

    /// 当前引用数量。
    pub fn ref_count(&self) -> usize {
        self.refcount.get()
    }

    /// 是否已销毁。
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// 按栈序遍历过滤器描述符。
    pub fn filters(&self) -> impl ExactSizeIterator<Item = &'static FilterDescriptor> + '_ {
        self.layout.iter().map(|element| element.filter)
    }

    /// 第 `index` 个元素。
    ///
    /// # Panics
    /// 栈已销毁或下标越界。
    pub fn element(&self, index: usize) -> ChannelElement<'_> {
        assert!(
            !self.is_destroyed(),
            "channel stack `{}` used after its last reference was released",
            self.name
        );
        assert!(
            index < self.count,
            "element {index} out of range for channel stack `{}` with {} elements",
            self.name,
            self.count
        );
        self.element_unchecked(index)
    }

    /// 最后一个（贴近传输层的）元素。
    pub fn last_element(&self) -> ChannelElement<'_> {
        self.element(self.count - 1)
    }

    pub(crate) fn element_unchecked(&self, index: usize) -> ChannelElement<'_> {
        ChannelElement { stack: self, index }
    }

    pub(crate) fn layout(&self) -> &[ElementLayout] {
        &self.layout
    }

    /// 发起一个通道操作：向下从元素 0 开始，向上从末元素开始。
    pub fn start_op(&self, op: TransportOp) {
        let elem = match op.direction {
            OpDirection::Down => self.element(0),
            OpDirection::Up => self.last_element(),
        };
        trace!(stack = %self.name, direction = ?op.direction, "start channel op");
        (elem.filter().start_channel_op)(elem, op);
    }

    /// 自元素 0 起遍历 `get_channel_info`。
    pub fn get_info(&self) -> ChannelInfo {
        let mut info = ChannelInfo::default();
        let elem = self.element(0);
        (elem.filter().get_channel_info)(elem, &mut info);
        info
    }

    /// 当前结构快照。
    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            name: self.name.to_string(),
            ref_count: self.ref_count(),
            call_stack_size: self.call_stack_size,
            channel_stack_size: self.channel_stack_size,
            filters: self
                .layout
                .iter()
                .enumerate()
                .map(|(index, element)| FilterSnapshot {
                    index,
                    name: element.filter.name,
                    instance: self.instance_at(index),
                    call_data_size: element.filter.call_data_size,
                    channel_data_size: element.filter.channel_data_size,
                })
                .collect(),
        }
    }

    fn instance_at(&self, index: usize) -> usize {
        let target = self.layout[index].filter;
        self.layout[..index]
            .iter()
            .filter(|element| core::ptr::eq(element.filter, target))
            .count()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            panic!("channel stack `{}` destroyed twice", self.name);
        }
        if let (Some(registry), Some(id)) = (&self.telemetry, self.telemetry_id.get()) {
            registry.unregister(*id);
        }
        for index in (0..self.count).rev() {
            let elem = self.element_unchecked(index);
            (elem.filter().destroy_channel)(elem);
            elem.set_state(ElementState::Destroyed);
        }
        let callback = self.on_destroy.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!(stack = %self.name, "channel stack destroyed");
    }
}

impl DataSource for ChannelStack {
    fn add_data(&self, sink: &mut dyn DataSink) {
        sink.add_stack(self.snapshot());
    }
}

impl fmt::Debug for ChannelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStack")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("call_stack_size", &self.call_stack_size)
            .field("refs", &self.refcount.get())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// 统计在 `elem` 之前、与其描述符相同的元素数量。
///
/// 供通用过滤器在 `post_init_channel` 阶段自我配置（例如嵌套的同名拦截器）。
///
/// # Panics
/// `elem` 不属于 `stack`。
pub fn filter_instance_number(stack: &ChannelStack, elem: ChannelElement<'_>) -> usize {
    assert!(
        core::ptr::eq(stack, elem.stack),
        "element {} does not belong to channel stack `{}`",
        elem.index,
        stack.name
    );
    stack.instance_at(elem.index)
}

/// 通道级元素：（所属栈，下标）。
#[derive(Clone, Copy)]
pub struct ChannelElement<'a> {
    stack: &'a ChannelStack,
    index: usize,
}

impl<'a> ChannelElement<'a> {
    /// 过滤器描述符。
    pub fn filter(&self) -> &'static FilterDescriptor {
        self.stack.layout[self.index].filter
    }

    /// 在栈中的位置。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 所属通道栈。
    pub fn channel_stack(&self) -> &'a ChannelStack {
        self.stack
    }

    /// 是否为栈首。
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    /// 是否为栈尾。
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.stack.count
    }

    /// 本过滤器的通道状态。
    pub fn channel_data(&self) -> ChannelData<'a> {
        let region = &self.stack.layout[self.index].channel_region;
        ChannelData::new(&self.stack.channel_data[region.start + 1..region.end])
    }

    /// 元素生命周期状态。
    pub fn state(&self) -> ElementState {
        ElementState::from_word(self.header().load(Ordering::Acquire))
    }

    /// 与本元素描述符相同、位于其前的元素数量。
    pub fn instance_number(&self) -> usize {
        self.stack.instance_at(self.index)
    }

    fn header(&self) -> &'a AtomicU64 {
        &self.stack.channel_data[self.stack.layout[self.index].channel_region.start]
    }

    fn set_state(&self, state: ElementState) {
        self.header().store(state.to_word(), Ordering::Release);
    }

    /// 沿操作方向把通道操作交给相邻元素；离开栈的任一端即消费该操作。
    pub fn forward_op(self, op: TransportOp) {
        let next = match op.direction {
            OpDirection::Down if self.is_last() => None,
            OpDirection::Down => Some(self.index + 1),
            OpDirection::Up if self.is_first() => None,
            OpDirection::Up => Some(self.index - 1),
        };
        match next {
            Some(index) => {
                let next = self.stack.element(index);
                (next.filter().start_channel_op)(next, op);
            }
            None => {
                trace!(stack = %self.stack.name, direction = ?op.direction, "channel op left the stack");
                op.consume();
            }
        }
    }

    /// 把 `get_info` 交给下一个元素；栈尾终止遍历。
    pub fn next_get_info(self, info: &mut ChannelInfo) {
        if self.is_last() {
            return;
        }
        let next = self.stack.element(self.index + 1);
        (next.filter().get_channel_info)(next, info);
    }
}

impl fmt::Debug for ChannelElement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelElement")
            .field("stack", &self.stack.name)
            .field("index", &self.index)
            .field("filter", &self.filter().name)
            .finish()
    }
}

/// 通道栈的共享所有权句柄。
///
/// # 教案式说明
/// - **意图（Why）**：把“增减引用计数”收敛为句柄的 `Clone`/`Drop`，由类型系统保证每次增加都有对应的释放。
/// - **逻辑（How）**：句柄持有 `Arc<ChannelStack>` 以保证内存有效，逻辑生命周期由 [`StackRefcount`] 决定；
///   计数归零的那次 `Drop` 执行销毁流程。
/// - **契约（What）**：`ref_with_reason` / `unref_with_reason` 只影响 `trace` 日志中的原因字段。
pub struct ChannelStackRef {
    stack: Arc<ChannelStack>,
    drop_reason: &'static str,
}

impl ChannelStackRef {
    fn adopt(stack: Arc<ChannelStack>) -> Self {
        Self {
            stack,
            drop_reason: DEFAULT_UNREF_REASON,
        }
    }

    /// 以给定原因增加一个引用。
    pub fn ref_with_reason(&self, reason: &'static str) -> Self {
        self.stack.refcount.acquire(&self.stack.name, reason);
        Self::adopt(Arc::clone(&self.stack))
    }

    /// 以给定原因释放本引用。
    pub fn unref_with_reason(mut self, reason: &'static str) {
        self.drop_reason = reason;
        drop(self);
    }

    /// 两个句柄是否指向同一个栈。
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.stack, &b.stack)
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelStack> {
        &self.stack
    }
}

impl Clone for ChannelStackRef {
    fn clone(&self) -> Self {
        self.ref_with_reason("clone")
    }
}

impl Drop for ChannelStackRef {
    fn drop(&mut self) {
        if self.stack.refcount.release(&self.stack.name, self.drop_reason) {
            self.stack.destroy();
        }
    }
}

impl Deref for ChannelStackRef {
    type Target = ChannelStack;

    fn deref(&self) -> &ChannelStack {
        &self.stack
    }
}

impl fmt::Debug for ChannelStackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.stack, f)
    }
}
