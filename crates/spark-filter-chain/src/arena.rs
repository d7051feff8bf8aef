//! 调用级对象 Arena。
//!
//! # 设计背景（Why）
//! - 调用状态只有定长的 8 字节字，过滤器却常需在调用期间暂存尺寸不定的对象（例如被传输层延后完成的回调）；
//! - Arena 与调用同寿，对象随调用释放，句柄可直接写入调用状态字。
//!
//! # 契约说明（What）
//! - [`ArenaSlot`] 从 1 开始编号，零值状态字表示“未分配”；
//! - `take` 取走后槽位置空，再次取用返回 `None`。

use std::{any::Any, fmt, num::NonZeroU64};

use parking_lot::Mutex;

/// Arena 中一个对象的句柄，可直接存入一个调用状态字。
///
/// 编号从 1 开始，状态字为 0 表示“未分配”，与零值内存语义一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaSlot(NonZeroU64);

impl ArenaSlot {
    /// 编码为状态字。
    pub fn to_word(self) -> u64 {
        self.0.get()
    }

    /// 从状态字还原；0 返回 `None`。
    pub fn from_word(word: u64) -> Option<Self> {
        NonZeroU64::new(word).map(ArenaSlot)
    }
}

/// 调用级对象 Arena。
///
/// # 教案式说明
/// - **意图（Why）**：调用状态只有定长字，过滤器若需要变长或带析构的对象（缓冲的消息、包裹的回调），
///   就把对象放入调用拥有的 Arena，并在自己的状态字里保存句柄。
/// - **逻辑（How）**：对象以 `Box<dyn Any + Send>` 顺序存放，句柄即下标加一；`take` 取走后槽位置空。
/// - **契约（What）**：
///   - Arena 由调用的创建方拥有，调用栈只通过调用参数引用它；
///   - Arena 随最后一个持有者释放而整体回收，不支持单独归还槽位。
#[derive(Default)]
pub struct CallArena {
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

impl CallArena {
    /// 构造空 Arena。
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入对象，返回句柄。
    pub fn alloc<T: Any + Send>(&self, value: T) -> ArenaSlot {
        let mut slots = self.slots.lock();
        slots.push(Some(Box::new(value)));
        let id = u64::try_from(slots.len()).unwrap_or(u64::MAX);
        ArenaSlot(NonZeroU64::new(id).unwrap_or(NonZeroU64::MAX))
    }

    /// 以独占方式访问对象；类型不符或已被取走时返回 `None`。
    pub fn with<T: Any + Send, R>(&self, slot: ArenaSlot, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        let value = slots.get_mut(Self::index(slot))?.as_mut()?;
        value.downcast_mut::<T>().map(f)
    }

    /// 取走对象。
    pub fn take<T: Any + Send>(&self, slot: ArenaSlot) -> Option<T> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(Self::index(slot))?;
        if !entry.as_ref()?.is::<T>() {
            return None;
        }
        entry
            .take()
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// 已分配的槽位数（含已取走的）。
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// 是否从未分配。
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn index(slot: ArenaSlot) -> usize {
        usize::try_from(slot.0.get() - 1).unwrap_or(usize::MAX)
    }
}

impl fmt::Debug for CallArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArena").field("slots", &self.len()).finish()
    }
}
