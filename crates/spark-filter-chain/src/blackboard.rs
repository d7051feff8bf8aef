//! 构建期只读共享上下文。
//!
//! # 设计背景（Why）
//! - 过滤器彼此独立编写，却可能需要共用进程级对象；通过黑板在构建时注入，避免全局变量。
//!
//! # 契约说明（What）
//! - 黑板在通道栈构建前填充，之后以 `Arc` 共享、只读。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// 构建期共享的只读黑板。
///
/// # 教案式说明
/// - **意图（Why）**：部分过滤器需要跨过滤器查找共享对象（例如同一进程内共用的限流表），
///   但不应拥有它，也不应通过全局变量耦合。
/// - **逻辑（How）**：以 `(TypeId, key)` 为索引保存 `Arc<dyn Any + Send + Sync>`，读取时按类型还原。
/// - **契约（What）**：通道栈构建前由创建方填充；交给过滤器后只读。同一键、不同类型的条目互不覆盖。
#[derive(Default)]
pub struct Blackboard {
    entries: HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>,
}

impl Blackboard {
    /// 构造空黑板。
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入条目，返回被替换的旧值。
    pub fn set<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: Arc<T>,
    ) -> Option<Arc<T>> {
        self.entries
            .insert((TypeId::of::<T>(), key.into()), value)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    /// 按类型与键读取条目。
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(&(TypeId::of::<T>(), key.to_owned()))
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// 条目数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blackboard")
            .field("entries", &self.entries.len())
            .finish()
    }
}
