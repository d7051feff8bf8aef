//! 多线程场景下的调用串行化与通道操作。
//!
//! # 教案级导览
//! - **Why**：同一调用的批次可能由多个线程同时发起，过滤器却按“自己的处理函数永不并发执行”编写；
//!   通道级操作与引用计数则天然跨线程。
//! - **How**：以 `std::thread::scope` 并发发起操作；调用状态上做非原子的读改写计数，
//!   一旦合并器未能串行化，运行时的 `try_lock` 检测会直接 panic。
//! - **What**：断言计数无丢失、每个回调恰好触发一次、通道只被销毁一次。

mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use spark_filter_chain::{
    CallElement, CallStack, CallStackArgs, ChannelElement, ChannelStackBuilder, FilterDescriptor,
    SerialCombiner, StreamOpBatch, TransportOp,
};
use support::{TRANSPORT, fixture};

const THREADS: usize = 8;
const PER_THREAD: usize = 50;

fn tally_call_op(elem: &mut CallElement<'_>, batch: StreamOpBatch) {
    let mut data = elem.call_data();
    let seen = data.get(0);
    thread::yield_now();
    data.set(0, seen + 1);
    elem.forward(batch);
}

fn tally_channel_op(elem: ChannelElement<'_>, op: TransportOp) {
    elem.channel_data().fetch_add(0, 1);
    elem.forward_op(op);
}

static TALLY: FilterDescriptor = FilterDescriptor::new("tally")
    .with_call_data_size(8)
    .with_channel_data_size(8)
    .with_start_call_op(tally_call_op)
    .with_start_channel_op(tally_channel_op);

/// ## 批次串行化
///
/// - **契约 (What)**：8 个线程各发起 50 个批次，读改写计数恰为 400，`on_complete` 恰好触发 400 次。
#[test]
fn batches_from_many_threads_are_serialized_per_call() {
    let (board, log) = fixture();
    let channel = ChannelStackBuilder::new("client")
        .filters([&TALLY, &TRANSPORT])
        .blackboard(board)
        .build()
        .expect("构建必须成功");
    let call = CallStack::init(
        &channel,
        CallStackArgs::new(Arc::new(SerialCombiner::new())),
    )
    .expect("调用初始化必须成功");
    let completed = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let call = call.clone();
            let completed = Arc::clone(&completed);
            scope.spawn(move || {
                for _ in 0..PER_THREAD {
                    let completed = Arc::clone(&completed);
                    let mut batch = StreamOpBatch::new();
                    batch.on_complete = Some(Box::new(move |result| {
                        assert!(result.is_ok());
                        completed.fetch_add(1, Ordering::SeqCst);
                    }));
                    call.start_batch(batch);
                }
            });
        }
    });

    let total = THREADS * PER_THREAD;
    assert_eq!(call.with_element(0, |elem| elem.call_data().get(0)), total as u64);
    assert_eq!(completed.load(Ordering::SeqCst), total);
    assert_eq!(log.count("call_op:transport"), total);
    assert_eq!(call.ref_count(), 1, "所有线程的克隆与派发引用均已归还");
}

#[test]
fn channel_ops_from_many_threads_all_reach_the_transport() {
    let (board, log) = fixture();
    let channel = ChannelStackBuilder::new("client")
        .filters([&TALLY, &TRANSPORT])
        .blackboard(board)
        .build()
        .expect("构建必须成功");
    let consumed = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for _ in 0..4 {
            let channel = channel.clone();
            let consumed = Arc::clone(&consumed);
            scope.spawn(move || {
                for _ in 0..PER_THREAD {
                    let consumed = Arc::clone(&consumed);
                    let mut op = TransportOp::downward();
                    op.on_consumed = Some(Box::new(move |_| {
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }));
                    channel.start_op(op);
                }
            });
        }
    });

    assert_eq!(channel.element(0).channel_data().load(0), 200);
    assert_eq!(log.count("channel_op:transport"), 200);
    assert_eq!(consumed.load(Ordering::SeqCst), 200);
}

#[test]
fn racing_releases_destroy_the_channel_exactly_once() {
    let (board, log) = fixture();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destroyed);
    let channel = ChannelStackBuilder::new("client")
        .filters([&TRANSPORT])
        .blackboard(board)
        .on_destroy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("构建必须成功");
    log.clear();

    let holders: Vec<_> = (0..THREADS)
        .map(|_| channel.ref_with_reason("racer"))
        .collect();
    drop(channel);
    thread::scope(|scope| {
        for holder in holders {
            scope.spawn(move || {
                let again = holder.clone();
                drop(holder);
                again.unref_with_reason("racer_done");
            });
        }
    });

    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(log.count("destroy_channel:transport"), 1);
}
