//! 原子类型切换层。
//!
//! 默认使用 `std` 原子；在 `--cfg loom` 且启用 `loom-model` Feature 时替换为 Loom 实现，
//! 让引用计数的“最后持有者负责拆除”规则可以被 Loom 穷举调度验证。

#[cfg(not(all(feature = "loom-model", any(loom, spark_loom))))]
pub(crate) use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(all(feature = "loom-model", any(loom, spark_loom)))]
pub(crate) use loom::sync::atomic::{AtomicUsize, Ordering};
