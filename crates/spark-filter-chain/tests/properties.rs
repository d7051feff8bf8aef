//! 过滤器栈的性质测试。
//!
//! # 教案级导览
//! - **核心目标 (Why)**：尺寸计算、构建顺序与失败扇出都是对“任意过滤器组合”成立的性质，
//!   单个示例无法覆盖组合空间。
//! - **设计手法 (How)**：使用 Proptest 生成描述符尺寸、过滤器序列与失败位置，
//!   每个用例都构建真实的通道栈与调用栈并断言可观测行为。
//! - **合同 (What)**：
//!   1. 尺寸只取决于描述符的尺寸字段，且与顺序无关；
//!   2. `init_call` 正序、`destroy_call` 逆序，各恰好一次；
//!   3. 在任意位置失败的批次，其每个回调恰好收到一次错误，失败点之后的元素从未看到该批次。

mod support;

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use spark_filter_chain::{
    CallStack, CallStackArgs, ChannelStackBuilder, FilterDescriptor, SerialCombiner,
    StreamOpBatch, call_stack_size, channel_stack_size, layout::align_state,
};
use support::{ALPHA, BETA, GAMMA, INTERCEPTOR, Outcomes, POISON, POISON_GUARD, TRANSPORT, fixture};

fn sized(call: usize, channel: usize) -> &'static FilterDescriptor {
    Box::leak(Box::new(
        FilterDescriptor::new("sized")
            .with_call_data_size(call)
            .with_channel_data_size(channel),
    ))
}

fn sizes() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0usize..100, 0usize..100), 1..8)
}

fn recording_chain() -> impl Strategy<Value = Vec<&'static FilterDescriptor>> {
    prop::collection::vec(
        prop::sample::select(vec![&ALPHA, &BETA, &GAMMA, &INTERCEPTOR]),
        0..6,
    )
    .prop_map(|mut filters| {
        filters.push(&TRANSPORT);
        filters
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sizes_depend_only_on_descriptor_sizes(sizes in sizes(), rotate in 0usize..8) {
        let filters: Vec<_> = sizes.iter().map(|&(call, channel)| sized(call, channel)).collect();
        let expected_call: usize = sizes.iter().map(|&(call, _)| 8 + align_state(call)).sum();
        let expected_channel: usize = sizes.iter().map(|&(_, channel)| 8 + align_state(channel)).sum();

        prop_assert_eq!(call_stack_size(&filters), expected_call);
        prop_assert_eq!(channel_stack_size(&filters), expected_channel);
        prop_assert_eq!(call_stack_size(&filters), call_stack_size(&filters));

        let mut permuted = filters.clone();
        let len = permuted.len();
        permuted.rotate_left(rotate % len);
        permuted.reverse();
        prop_assert_eq!(call_stack_size(&permuted), expected_call);
        prop_assert_eq!(channel_stack_size(&permuted), expected_channel);

        let channel = ChannelStackBuilder::new("sized")
            .filters(filters.iter().copied())
            .build()
            .expect("默认回调的过滤器必须构建成功");
        prop_assert_eq!(channel.call_stack_size(), expected_call);
        prop_assert_eq!(channel.channel_stack_size(), expected_channel);
        let call = CallStack::init(&channel, CallStackArgs::new(Arc::new(SerialCombiner::new())))
            .expect("默认回调的调用必须初始化成功");
        prop_assert_eq!(call.state_bytes(), expected_call);
    }

    #[test]
    fn prop_call_elements_init_forward_and_destroy_in_reverse(filters in recording_chain()) {
        let (board, log) = fixture();
        let channel = ChannelStackBuilder::new("chain")
            .filters(filters.iter().copied())
            .blackboard(board)
            .build()
            .expect("记录型过滤器链必须构建成功");
        let names: Vec<&str> = filters.iter().map(|filter| filter.name).collect();

        log.clear();
        let call = CallStack::init(&channel, CallStackArgs::new(Arc::new(SerialCombiner::new())))
            .expect("调用初始化必须成功");
        let inits: Vec<String> = names.iter().map(|name| format!("init_call:{name}")).collect();
        prop_assert_eq!(log.events(), inits);

        log.clear();
        drop(call);
        let destroyed: Vec<String> = log
            .matching("destroy_call")
            .into_iter()
            .map(|event| event.split(':').nth(1).unwrap_or_default().to_owned())
            .collect();
        let reversed: Vec<String> = names.iter().rev().map(|name| (*name).to_owned()).collect();
        prop_assert_eq!(destroyed, reversed);
    }

    #[test]
    fn prop_failed_batch_fans_out_once_and_stops(
        before in 0usize..4,
        after in 0usize..4,
        wanted in prop::array::uniform4(any::<bool>()),
    ) {
        let mut filters: Vec<&'static FilterDescriptor> = vec![&INTERCEPTOR; before];
        filters.push(&POISON_GUARD);
        filters.extend(std::iter::repeat_n(&INTERCEPTOR, after));
        filters.push(&TRANSPORT);

        let (board, log) = fixture();
        let channel = ChannelStackBuilder::new("fanout")
            .filters(filters.iter().copied())
            .blackboard(board)
            .build()
            .expect("构建必须成功");
        let call = CallStack::init(&channel, CallStackArgs::new(Arc::new(SerialCombiner::new())))
            .expect("调用初始化必须成功");
        log.clear();

        let outcomes = Outcomes::new();
        let mut batch = StreamOpBatch::new();
        batch.send_message = Some(Bytes::from_static(POISON));
        if wanted[0] {
            batch.recv_initial_metadata = Some(outcomes.callback("initial"));
        }
        if wanted[1] {
            batch.recv_message = Some(outcomes.callback("message"));
        }
        if wanted[2] {
            batch.recv_trailing_metadata = Some(outcomes.callback("trailing"));
        }
        if wanted[3] {
            batch.on_complete = Some(outcomes.callback("complete"));
        }
        let registered = batch.callback_count();
        call.start_batch(batch);

        let seen = outcomes.take();
        prop_assert_eq!(seen.len(), registered);
        prop_assert!(seen.iter().all(|(_, result)| result.is_err()));
        prop_assert_eq!(log.count("call_op:interceptor"), before);
        prop_assert_eq!(log.count("call_op:poison_guard"), 1);
        prop_assert_eq!(log.count("call_op:transport"), 0);
    }
}
