//! 集成测试共享的记录型过滤器。
//!
//! # 教案级导览
//! - **Why**：描述符是函数指针表，无法捕获测试局部状态；记录型过滤器通过通道黑板取得事件日志，
//!   让每个测试拥有独立日志而不依赖全局变量，测试可以并行执行。
//! - **How**：所有记录型回调都把 `"<事件>:<过滤器名>"` 追加到 [`EventLog`]；失败注入由通道配置驱动：
//!   - `test.fail_init_channel = "<name>"`：该过滤器 `init_channel` 失败；
//!   - `test.fail_init_call = "<name>"`：该过滤器 `init_call` 失败；
//!   - `test.defer_teardown = true`：传输过滤器把拆除信号暂存到日志中，由测试手动完成。
//! - **What**：[`TRANSPORT`] 必须位于栈尾；它暂存 `recv_trailing_metadata`，直到收到携带
//!   `send_trailing_metadata` 的批次才以成功完成。

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_filter_chain::{
    ArenaSlot, BatchCallback, BatchState, Blackboard, CallElement, CallElementArgs, CallFinalInfo,
    ChannelArgs, ChannelElement, ChannelElementArgs, ChannelInfo, ChannelStack, FilterDescriptor,
    FilterError, Metadata, PollingEntity, StatusCode, StreamOpBatch, TeardownCompletion,
    TransportOp, codes, filter_instance_number,
};

pub const LOG_KEY: &str = "test.event_log";
pub const FAIL_INIT_CHANNEL: &str = "test.fail_init_channel";
pub const FAIL_INIT_CALL: &str = "test.fail_init_call";
pub const DEFER_TEARDOWN: &str = "test.defer_teardown";
pub const POISON: &[u8] = b"poison";

/// 按发生顺序记录过滤器回调。
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
    deferred: Mutex<Vec<TeardownCompletion>>,
}

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// 以 `prefix` 开头的事件。
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn defer(&self, completion: TeardownCompletion) {
        self.deferred.lock().push(completion);
    }

    /// 完成全部暂存的拆除信号，返回数量。
    pub fn release_deferred(&self) -> usize {
        let deferred: Vec<_> = self.deferred.lock().drain(..).collect();
        let released = deferred.len();
        for completion in deferred {
            completion.complete();
        }
        released
    }
}

/// 携带事件日志的黑板。
pub fn fixture() -> (Arc<Blackboard>, Arc<EventLog>) {
    let log = Arc::new(EventLog::default());
    let mut board = Blackboard::new();
    board.set(LOG_KEY, Arc::clone(&log));
    (Arc::new(board), log)
}

pub fn strs(events: &[&str]) -> Vec<String> {
    events.iter().map(|event| (*event).to_owned()).collect()
}

fn log_for(stack: &ChannelStack) -> Arc<EventLog> {
    stack
        .blackboard()
        .and_then(|board| board.get::<EventLog>(LOG_KEY))
        .expect("测试通道必须携带事件日志")
}

fn call_log(elem: &CallElement<'_>) -> Arc<EventLog> {
    log_for(elem.call_stack().channel_stack())
}

fn configured_to_fail(args: &ChannelArgs, key: &str, name: &str) -> bool {
    args.get_str(key) == Some(name)
}

fn recording_init_channel(
    elem: ChannelElement<'_>,
    args: &ChannelElementArgs<'_>,
) -> Result<(), FilterError> {
    let name = elem.filter().name;
    log_for(args.channel_stack).record(format!("init_channel:{name}"));
    if configured_to_fail(args.channel_args, FAIL_INIT_CHANNEL, name) {
        return Err(FilterError::internal(format!("{name} refused the channel")));
    }
    let data = elem.channel_data();
    if data.len_words() > 0 {
        data.store(0, elem.index() as u64 + 1);
    }
    Ok(())
}

fn recording_post_init(stack: &ChannelStack, elem: ChannelElement<'_>) {
    let instance = filter_instance_number(stack, elem);
    log_for(stack).record(format!("post_init:{}#{instance}", elem.filter().name));
}

fn recording_destroy_channel(elem: ChannelElement<'_>) {
    log_for(elem.channel_stack()).record(format!("destroy_channel:{}", elem.filter().name));
}

fn recording_init_call(
    elem: &mut CallElement<'_>,
    args: &CallElementArgs<'_>,
) -> Result<(), FilterError> {
    let name = elem.filter().name;
    let channel = args.call_stack.channel_stack();
    log_for(channel).record(format!("init_call:{name}"));
    assert!(elem.call_data().is_zeroed(), "init_call 必须拿到零值内存");
    if configured_to_fail(channel.channel_args(), FAIL_INIT_CALL, name) {
        return Err(FilterError::new(
            codes::CALL_INIT_FAILED,
            StatusCode::Unauthenticated,
            format!("{name} rejected the call"),
        ));
    }
    let marker = elem.index() as u64 + 1;
    elem.call_data().set(0, marker);
    Ok(())
}

fn record_destroy(elem: &mut CallElement<'_>) -> Arc<EventLog> {
    let name = elem.filter().name;
    let zeroed = elem.call_data().is_zeroed();
    let log = call_log(elem);
    log.record(format!(
        "destroy_call:{name}:{}",
        if zeroed { "zeroed" } else { "initialised" }
    ));
    log
}

fn recording_destroy_call(
    elem: &mut CallElement<'_>,
    _info: &CallFinalInfo,
    completion: Option<TeardownCompletion>,
) {
    let log = record_destroy(elem);
    if let Some(completion) = completion {
        log.record(format!("completion:{}", elem.filter().name));
        completion.complete();
    }
}

fn recording_polling_entity(elem: &mut CallElement<'_>, entity: &PollingEntity) {
    call_log(elem).record(format!("polling:{}:{entity:?}", elem.filter().name));
}

fn recording_call_op(elem: &mut CallElement<'_>, batch: StreamOpBatch) {
    call_log(elem).record(format!("call_op:{}", elem.filter().name));
    elem.forward(batch);
}

fn recording_channel_op(elem: ChannelElement<'_>, op: TransportOp) {
    log_for(elem.channel_stack()).record(format!("channel_op:{}", elem.filter().name));
    elem.forward_op(op);
}

const fn recording(name: &'static str) -> FilterDescriptor {
    FilterDescriptor::new(name)
        .with_call_data_size(8)
        .with_init_channel(recording_init_channel)
        .with_post_init_channel(recording_post_init)
        .with_destroy_channel(recording_destroy_channel)
        .with_init_call(recording_init_call)
        .with_set_polling_entity(recording_polling_entity)
        .with_destroy_call(recording_destroy_call)
        .with_start_call_op(recording_call_op)
        .with_start_channel_op(recording_channel_op)
}

fn alpha_get_info(elem: ChannelElement<'_>, info: &mut ChannelInfo) {
    info.service_config_json = Some("{\"retry\":false}".to_owned());
    elem.next_get_info(info);
}

pub static ALPHA: FilterDescriptor = recording("alpha")
    .with_channel_data_size(8)
    .with_get_channel_info(alpha_get_info);

pub static BETA: FilterDescriptor = recording("beta").with_call_data_size(12);

pub static GAMMA: FilterDescriptor = recording("gamma")
    .with_call_data_size(24)
    .with_channel_data_size(4);

/// 可被多次堆叠的通用拦截器。
pub static INTERCEPTOR: FilterDescriptor = recording("interceptor");

fn poison_guard_call_op(elem: &mut CallElement<'_>, batch: StreamOpBatch) {
    call_log(elem).record(format!("call_op:{}", elem.filter().name));
    if batch.send_message.as_deref() == Some(POISON) {
        elem.fail_batch(
            batch,
            FilterError::new(
                codes::BATCH_FAILED,
                StatusCode::PermissionDenied,
                "poisoned message",
            ),
        );
    } else {
        elem.forward(batch);
    }
}

/// 遇到 [`POISON`] 消息时在本元素注入失败。
pub static POISON_GUARD: FilterDescriptor =
    recording("poison_guard").with_start_call_op(poison_guard_call_op);

const TRAILERS_WORD: usize = 1;

fn transport_init_channel(
    elem: ChannelElement<'_>,
    args: &ChannelElementArgs<'_>,
) -> Result<(), FilterError> {
    if !args.is_last {
        return Err(FilterError::internal("transport must be the last filter"));
    }
    recording_init_channel(elem, args)
}

fn transport_call_op(elem: &mut CallElement<'_>, mut batch: StreamOpBatch) {
    call_log(elem).record("call_op:transport");
    assert_eq!(
        batch.state(),
        BatchState::DeliveredToTransport,
        "到达栈尾的批次必须处于已交付传输层状态"
    );
    let combiner = Arc::clone(elem.combiner());
    let arena = Arc::clone(elem.arena());

    if let Some(callback) = batch.recv_trailing_metadata.take() {
        let slot = arena.alloc::<BatchCallback<Metadata>>(callback);
        elem.call_data().set(TRAILERS_WORD, slot.to_word());
    }
    if batch.send_trailing_metadata.is_some() {
        let stashed = ArenaSlot::from_word(elem.call_data().get(TRAILERS_WORD))
            .and_then(|slot| arena.take::<BatchCallback<Metadata>>(slot));
        if let Some(callback) = stashed {
            elem.call_data().set(TRAILERS_WORD, 0);
            let mut trailers = Metadata::new();
            trailers.insert("grpc-status", "0");
            combiner.start(
                Box::new(move || callback(Ok(trailers))),
                "transport.recv_trailing_metadata",
            );
        }
    }
    if let Some(callback) = batch.recv_initial_metadata.take() {
        combiner.start(
            Box::new(move || callback(Ok(Metadata::new()))),
            "transport.recv_initial_metadata",
        );
    }
    if let Some(callback) = batch.recv_message.take() {
        combiner.start(
            Box::new(move || callback(Ok(Some(Bytes::from_static(b"pong"))))),
            "transport.recv_message",
        );
    }
    if let Some(callback) = batch.on_complete.take() {
        combiner.start(
            Box::new(move || callback(Ok(()))),
            "transport.on_complete",
        );
    }
}

fn transport_destroy_call(
    elem: &mut CallElement<'_>,
    info: &CallFinalInfo,
    completion: Option<TeardownCompletion>,
) {
    let stashed = ArenaSlot::from_word(elem.call_data().get(TRAILERS_WORD))
        .and_then(|slot| elem.arena().take::<BatchCallback<Metadata>>(slot));
    if let Some(callback) = stashed {
        elem.call_data().set(TRAILERS_WORD, 0);
        elem.combiner().start(
            Box::new(move || callback(Err(FilterError::cancelled("call destroyed")))),
            "transport.cancel_pending",
        );
    }
    let log = record_destroy(elem);
    log.record(format!("final_status:{:?}", info.status));
    if let Some(completion) = completion {
        let channel = elem.call_stack().channel_stack();
        if channel.channel_args().get_bool(DEFER_TEARDOWN) == Some(true) {
            log.record("completion:deferred");
            log.defer(completion);
        } else {
            log.record("completion:transport");
            completion.complete();
        }
    }
}

fn transport_get_info(_elem: ChannelElement<'_>, info: &mut ChannelInfo) {
    info.lb_policy_name = Some("pick_first".to_owned());
}

/// 贴近传输层的栈尾过滤器。
pub static TRANSPORT: FilterDescriptor = recording("transport")
    .with_call_data_size(16)
    .with_channel_data_size(8)
    .with_init_channel(transport_init_channel)
    .with_start_call_op(transport_call_op)
    .with_destroy_call(transport_destroy_call)
    .with_get_channel_info(transport_get_info);

/// 记录回调结果的批次辅助。
pub struct Outcomes {
    pub seen: Arc<Mutex<Vec<(String, Result<(), FilterError>)>>>,
}

impl Outcomes {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback<T: Send + 'static>(&self, label: &str) -> BatchCallback<T> {
        let seen = Arc::clone(&self.seen);
        let label = label.to_owned();
        Box::new(move |result: Result<T, FilterError>| {
            seen.lock().push((label, result.map(|_| ())));
        })
    }

    pub fn take(&self) -> Vec<(String, Result<(), FilterError>)> {
        std::mem::take(&mut *self.seen.lock())
    }
}
