//! 栈内存布局：尺寸计算、元素区段与状态视图。
//!
//! # 设计总览（Why）
//! - 通道栈与调用栈各自只持有一块连续状态内存，过滤器实例状态以“区段”形式按偏移寻址，
//!   构建期一次算好、此后不再变化，调用热路径上没有逐过滤器的堆分配；
//! - 状态以 8 字节字（word）为单位存放：调用状态为独占的 `u64`，通道状态为可被并发调用共享读写的
//!   `AtomicU64`。
//!
//! # 布局（How）
//! ```text
//! | hdr0 | state0 ... | hdr1 | state1 ... | ... | hdrN-1 | stateN-1 ... |
//! ```
//! - `hdr` 为一个字的元素头，记录 [`ElementState`]；它就是每个元素固定的 [`ELEMENT_OVERHEAD`]；
//! - `state` 为过滤器声明尺寸按 [`STATE_ALIGNMENT`] 向上取整后的字数。
//!
//! # 契约（What）
//! - [`channel_stack_size`] / [`call_stack_size`] 只依赖各过滤器声明的尺寸（尺寸纯函数性）；
//! - 调用栈的后备内存字节数必须恰好等于通道栈缓存的调用栈尺寸。

use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::filter::FilterDescriptor;

/// 单个状态字的字节数。
pub const WORD_BYTES: usize = std::mem::size_of::<u64>();

/// 过滤器状态的对齐粒度。
pub const STATE_ALIGNMENT: usize = WORD_BYTES;

/// 每个元素固定开销（元素头）的字节数。
pub const ELEMENT_OVERHEAD: usize = WORD_BYTES;

/// 将字节数向上取整到 [`STATE_ALIGNMENT`]。
pub const fn align_state(bytes: usize) -> usize {
    bytes.div_ceil(STATE_ALIGNMENT) * STATE_ALIGNMENT
}

/// 计算一组过滤器所需的通道栈状态字节数。
pub fn channel_stack_size(filters: &[&FilterDescriptor]) -> usize {
    filters
        .iter()
        .map(|filter| ELEMENT_OVERHEAD + align_state(filter.channel_data_size))
        .sum()
}

/// 计算一组过滤器所需的调用栈状态字节数。
///
/// 通道栈在构建时调用一次并缓存结果，此后每个调用都按该值分配。
pub fn call_stack_size(filters: &[&FilterDescriptor]) -> usize {
    filters
        .iter()
        .map(|filter| ELEMENT_OVERHEAD + align_state(filter.call_data_size))
        .sum()
}

/// 元素生命周期，写入每个元素区段的头部字。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ElementState {
    /// 刚分配的零值内存，尚未初始化。
    Zeroed = 0,
    /// `init_*` 成功。
    Initialized = 1,
    /// `init_call` 失败；区段仍会参与销毁。
    InitFailed = 2,
    /// 通道元素已完成 `post_init_channel`。
    Ready = 3,
    /// `destroy_*` 已执行。
    Destroyed = 4,
}

impl ElementState {
    pub(crate) fn from_word(word: u64) -> Self {
        match word {
            0 => ElementState::Zeroed,
            1 => ElementState::Initialized,
            2 => ElementState::InitFailed,
            3 => ElementState::Ready,
            4 => ElementState::Destroyed,
            other => panic!("corrupted element header word {other:#x}"),
        }
    }

    pub(crate) fn to_word(self) -> u64 {
        self as u64
    }
}

/// 单个元素在两块状态内存中的区段（以字为单位，含头部字）。
#[derive(Clone, Debug)]
pub(crate) struct ElementLayout {
    pub(crate) filter: &'static FilterDescriptor,
    pub(crate) channel_region: Range<usize>,
    pub(crate) call_region: Range<usize>,
}

/// 按过滤器顺序计算连续区段，返回（元素布局，通道字数，调用字数）。
pub(crate) fn compute_layout(
    filters: &[&'static FilterDescriptor],
) -> (Box<[ElementLayout]>, usize, usize) {
    let mut channel_cursor = 0;
    let mut call_cursor = 0;
    let layout = filters
        .iter()
        .copied()
        .map(|filter| {
            let channel_words = (ELEMENT_OVERHEAD + align_state(filter.channel_data_size)) / WORD_BYTES;
            let call_words = (ELEMENT_OVERHEAD + align_state(filter.call_data_size)) / WORD_BYTES;
            let element = ElementLayout {
                filter,
                channel_region: channel_cursor..channel_cursor + channel_words,
                call_region: call_cursor..call_cursor + call_words,
            };
            channel_cursor += channel_words;
            call_cursor += call_words;
            element
        })
        .collect();
    (layout, channel_cursor, call_cursor)
}

/// 通道级状态视图。
///
/// # 教案式说明
/// - **意图（Why）**：通道状态被该通道上所有调用并发读取，运行时不提供额外串行化，
///   因此视图只暴露原子操作，需要更复杂同步的过滤器应自行把句柄放进黑板或调用 Arena。
/// - **契约（What）**：下标以字为单位、从 0 开始，越界访问属于编程错误并 `panic`。
#[derive(Clone, Copy, Debug)]
pub struct ChannelData<'a> {
    words: &'a [AtomicU64],
}

impl<'a> ChannelData<'a> {
    pub(crate) fn new(words: &'a [AtomicU64]) -> Self {
        Self { words }
    }

    /// 读取一个字。
    pub fn load(&self, word: usize) -> u64 {
        self.words[word].load(Ordering::Acquire)
    }

    /// 写入一个字。
    pub fn store(&self, word: usize, value: u64) {
        self.words[word].store(value, Ordering::Release);
    }

    /// 原子加，返回旧值。
    pub fn fetch_add(&self, word: usize, delta: u64) -> u64 {
        self.words[word].fetch_add(delta, Ordering::AcqRel)
    }

    /// 原子减，返回旧值。
    pub fn fetch_sub(&self, word: usize, delta: u64) -> u64 {
        self.words[word].fetch_sub(delta, Ordering::AcqRel)
    }

    /// 字数。
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// 字节数（已对齐）。
    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }
}

/// 调用级状态视图，调用串行化保证其独占。
#[derive(Debug)]
pub struct CallData<'a> {
    words: &'a mut [u64],
}

impl<'a> CallData<'a> {
    pub(crate) fn new(words: &'a mut [u64]) -> Self {
        Self { words }
    }

    /// 读取一个字。
    pub fn get(&self, word: usize) -> u64 {
        self.words[word]
    }

    /// 写入一个字。
    pub fn set(&mut self, word: usize, value: u64) {
        self.words[word] = value;
    }

    /// 全部状态字。
    pub fn words(&self) -> &[u64] {
        &self.words[..]
    }

    /// 全部状态字（可写）。
    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words[..]
    }

    /// 是否仍为零值内存。
    pub fn is_zeroed(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// 字节数（已对齐）。
    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }
}
