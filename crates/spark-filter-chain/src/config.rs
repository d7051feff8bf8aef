//! 通道级配置。
//!
//! # 设计背景（Why）
//! - 过滤器在 `init_channel` 阶段按需读取配置（例如压缩级别、鉴权开关），运行时本身不解释任何键；
//! - 配置需要既能在代码中逐项拼装，也能从 TOML/JSON 文档整体反序列化，因此以 `serde` 描述。
//!
//! # 契约说明（What）
//! - 键为字符串，建议遵循 `<组件>.<选项>` 命名；
//! - 值限定为布尔、整数、字符串三类，类型不符的读取返回 `None` 而非报错。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 单个配置值。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// 布尔值。
    Bool(bool),
    /// 整数值。
    Int(i64),
    /// 字符串值。
    Str(String),
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

/// 有序的通道配置表。
///
/// # 教案式说明
/// - **意图（Why）**：同一组配置会被栈上所有过滤器共享读取，有序存储保证日志与快照输出稳定。
/// - **逻辑（How）**：内部为 `BTreeMap<String, ArgValue>`，`serde(transparent)` 让文档形态就是一张扁平表。
/// - **契约（What）**：构建完成后以只读方式交给过滤器；过滤器不得假设未声明的键存在。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelArgs {
    entries: BTreeMap<String, ArgValue>,
}

impl ChannelArgs {
    /// 构造空配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式写入一项配置，同名键被覆盖。
    pub fn set(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// 读取原始值。
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries.get(key)
    }

    /// 读取整数值。
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(ArgValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// 读取布尔值。
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(ArgValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// 读取字符串值。
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ArgValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// 是否包含某个键。
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 配置项数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按键序遍历。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}
