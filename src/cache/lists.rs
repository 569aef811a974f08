//! 缓冲区链表
//!
//! 处置链表和空闲链表都是有序集合：表头是最旧的元素，表尾是最新的。
//! 底层使用 `lru::LruCache`，表头对应 LRU 端，表尾对应 MRU 端，
//! 所有的插入、删除、移到表尾都是 O(1)。

use lru::LruCache;

use crate::types::BufferId;

/// 有序缓冲区链表
pub(crate) struct BufList {
    inner: LruCache<BufferId, ()>,
}

impl BufList {
    pub fn new() -> Self {
        Self { inner: LruCache::unbounded() }
    }

    /// 追加到表尾
    pub fn push_back(&mut self, id: BufferId) {
        if self.inner.put(id, ()).is_some() {
            log::error!("[BUFFER] buffer {} inserted twice into one list", id);
            panic!("buffer list corrupted: duplicate entry {}", id);
        }
    }

    /// 插入到表头
    pub fn push_front(&mut self, id: BufferId) {
        self.push_back(id);
        self.inner.demote(&id);
    }

    /// 从链表中删除
    ///
    /// # 返回
    ///
    /// 元素不在链表中时返回 `false`
    pub fn remove(&mut self, id: BufferId) -> bool {
        self.inner.pop(&id).is_some()
    }

    /// 移到表尾
    pub fn move_to_back(&mut self, id: BufferId) {
        self.inner.promote(&id);
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.inner.contains(&id)
    }

    /// 表头元素
    pub fn front(&self) -> Option<BufferId> {
        self.inner.peek_lru().map(|(id, _)| *id)
    }

    /// 从表头到表尾遍历
    pub fn iter(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.inner.iter().rev().map(|(id, _)| *id)
    }

    /// 从表头开始最多取 `n` 个元素的快照
    pub fn snapshot(&self, n: usize) -> Vec<BufferId> {
        self.iter().take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
