use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use spark_filter_chain::{
    CallStack, CallStackArgs, ChannelStackBuilder, ChannelStackRef, FilterDescriptor,
    SerialCombiner, StreamOpBatch,
};

static AUTH: FilterDescriptor = FilterDescriptor::new("auth").with_call_data_size(16);
static COMPRESSION: FilterDescriptor = FilterDescriptor::new("compression")
    .with_call_data_size(8)
    .with_channel_data_size(8);
static RETRY: FilterDescriptor = FilterDescriptor::new("retry").with_call_data_size(32);

fn consume(_elem: &mut spark_filter_chain::CallElement<'_>, batch: StreamOpBatch) {
    black_box(batch);
}

static SINK: FilterDescriptor = FilterDescriptor::new("sink")
    .with_call_data_size(8)
    .with_start_call_op(consume);

fn channel() -> ChannelStackRef {
    ChannelStackBuilder::new("bench")
        .filters([&AUTH, &COMPRESSION, &RETRY, &SINK])
        .build()
        .expect("基准通道必须构建成功")
}

/// 调用栈热路径基准：一次构建加一次拆除，以及单个批次穿过四个过滤器的派发。
///
/// # 设计目的（Why）
/// - 调用建立与拆除发生在每个 RPC 上，单次状态分配的收益需要可量化的基线；
/// - 派发基准覆盖“逐元素转发”的切分成本，便于回归时对比。
///
/// # 执行逻辑（How）
/// - 过滤器均使用默认回调，只测量运行时自身的开销；
/// - 合并器在循环外构造并复用，排除 `Arc` 分配噪声。
fn bench_call_stack(c: &mut Criterion) {
    let channel = channel();
    let combiner = Arc::new(SerialCombiner::new());

    c.bench_function("call_stack/init_destroy", |b| {
        b.iter(|| {
            let call = CallStack::init(&channel, CallStackArgs::new(combiner.clone()))
                .expect("默认回调不会失败");
            black_box(call.state_bytes());
        })
    });

    let call = CallStack::init(&channel, CallStackArgs::new(combiner.clone()))
        .expect("默认回调不会失败");
    c.bench_function("call_stack/dispatch_batch", |b| {
        b.iter(|| call.start_batch(StreamOpBatch::new()))
    });
}

criterion_group!(filter_chain_benches, bench_call_stack);
criterion_main!(filter_chain_benches);
