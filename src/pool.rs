//! 标识池
//! 按派生标识（identity key）对对象去重：同一个 key 永远返回同一个实例
//!
//! 每种实体类型各自持有一个池实例，由执行器注入，不存在隐藏的全局状态

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;

struct PoolEntries<V> {
    /// 插入顺序，迭代时按此顺序生成快照
    order: Vec<String>,
    values: HashMap<String, Arc<V>>,
}

/// 通用的按标识去重注册表
pub struct IdentityPool<V> {
    /// 池名称（仅用于日志）
    name: &'static str,
    entries: RwLock<PoolEntries<V>>,
}

impl<V> IdentityPool<V> {
    /// 创建空池
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(PoolEntries {
                order: Vec::new(),
                values: HashMap::new(),
            }),
        }
    }

    /// 获取已存在的对象，不存在时用 factory 创建并登记
    ///
    /// 已存在时 factory 不会被调用
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let mut entries = self.entries.write();
        // 读锁与写锁之间可能已被其他调用方创建
        if let Some(existing) = entries.values.get(key) {
            return existing.clone();
        }

        let value = Arc::new(factory());
        entries.order.push(key.to_string());
        entries.values.insert(key.to_string(), value.clone());
        debug!(pool = self.name, key = %key, "Pooled new object");
        value
    }

    /// 同 [`get_or_create`](Self::get_or_create)，但 factory 可能失败
    ///
    /// factory 失败时池内不登记任何内容
    pub fn try_get_or_create<F>(&self, key: &str, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.values.get(key) {
            return Ok(existing.clone());
        }

        let value = Arc::new(factory()?);
        entries.order.push(key.to_string());
        entries.values.insert(key.to_string(), value.clone());
        debug!(pool = self.name, key = %key, "Pooled new object");
        Ok(value)
    }

    /// 按 key 查找
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.read().values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().values.contains_key(key)
    }

    /// 移除对象，之后同 key 的查找会创建新实例
    pub fn remove(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.write();
        let removed = entries.values.remove(key);
        if removed.is_some() {
            entries.order.retain(|k| k != key);
            debug!(pool = self.name, key = %key, "Removed object from pool");
        }
        removed
    }

    /// 当前对象的快照迭代器
    ///
    /// 每次调用都生成新快照，迭代期间的池修改不会影响已生成的快照
    pub fn iter(&self) -> std::vec::IntoIter<Arc<V>> {
        let entries = self.entries.read();
        let snapshot: Vec<Arc<V>> = entries
            .order
            .iter()
            .filter_map(|key| entries.values.get(key).cloned())
            .collect();
        snapshot.into_iter()
    }

    /// 查找满足条件的对象（不可在 factory 内调用，锁不可重入）
    pub(crate) fn find<P>(&self, predicate: P) -> Option<Arc<V>>
    where
        P: Fn(&V) -> bool,
    {
        self.entries
            .read()
            .values
            .values()
            .find(|value| predicate(value))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空池（测试隔离用）
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.order.clear();
        entries.values.clear();
    }
}

impl<V> std::fmt::Debug for IdentityPool<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityPool")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
