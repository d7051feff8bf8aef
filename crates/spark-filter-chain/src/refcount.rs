use tracing::trace;

use crate::sync::{AtomicUsize, Ordering};

/// 通道栈与调用栈共享的原子引用计数。
///
/// # 教案式说明
/// - **意图（Why）**：栈的逻辑生命周期由多方持有（通道对象、在途调用、后台簿记），
///   需要“最后一个持有者负责拆除”的确定性规则，并保证拆除恰好执行一次。
/// - **逻辑（How）**：`acquire` 以 `Relaxed` 递增（持有者已经拥有有效引用）；`release` 以 `AcqRel`
///   递减，返回 `true` 表示调用方是最后的持有者，必须执行拆除。
/// - **契约（What）**：
///   - 从零“复活”或递减到零以下都视为所有权纪律被破坏，立即 `panic`；
///   - `reason` 仅用于 `trace` 级日志，帮助定位泄漏的引用。
/// - **布局约束**：[`ChannelStack`](crate::ChannelStack) 与 [`CallStack`](crate::CallStack) 都把本结构放在
///   `#[repr(C)]` 布局的首字段，外部拿到“引用计数地址”与“栈地址”可以互换。
#[derive(Debug)]
pub struct StackRefcount {
    count: AtomicUsize,
}

impl StackRefcount {
    /// 以给定初始值构造计数器。
    pub fn new(initial: usize) -> Self {
        assert!(initial > 0, "a stack refcount must start with at least one holder");
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    /// 增加一个持有者。
    pub fn acquire(&self, object: &str, reason: &'static str) {
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(
            previous > 0,
            "`{object}` was referenced again after its refcount reached zero ({reason})"
        );
        trace!(object, reason, refs = previous + 1, "stack ref");
    }

    /// 释放一个持有者；返回 `true` 时调用方必须执行拆除。
    pub fn release(&self, object: &str, reason: &'static str) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "`{object}` was released more times than it was referenced ({reason})"
        );
        trace!(object, reason, refs = previous - 1, "stack unref");
        previous == 1
    }

    /// 当前持有者数量，仅用于观测。
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
