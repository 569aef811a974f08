//! 哈希索引
//!
//! (设备, 块号) → 描述符。桶数在初始化时按总内存选定，冲突用链解决。
//! 查找只比较设备与块号；块大小是否一致由调用者检查。

use crate::types::{BufferId, DeviceId};

pub(crate) struct HashIndex {
    buckets: Vec<Vec<BufferId>>,
}

impl HashIndex {
    pub fn new(nr_hash: usize) -> Self {
        Self { buckets: (0..nr_hash).map(|_| Vec::new()).collect() }
    }

    pub fn nr_hash(&self) -> usize {
        self.buckets.len()
    }

    fn hashfn(&self, dev: DeviceId, block: u64) -> usize {
        ((u64::from(dev.raw()) ^ block) % self.buckets.len() as u64) as usize
    }

    /// 插入到桶的链头
    pub fn insert(&mut self, dev: DeviceId, block: u64, id: BufferId) {
        let h = self.hashfn(dev, block);
        self.buckets[h].insert(0, id);
    }

    /// 从桶中删除
    pub fn remove(&mut self, dev: DeviceId, block: u64, id: BufferId) -> bool {
        let h = self.hashfn(dev, block);
        let chain = &mut self.buckets[h];
        match chain.iter().position(|&x| x == id) {
            Some(pos) => {
                chain.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 查找
    ///
    /// `matches` 判断链上的某个描述符是否就是 (dev, block)
    pub fn find(
        &self,
        dev: DeviceId,
        block: u64,
        matches: impl Fn(BufferId) -> bool,
    ) -> Option<BufferId> {
        self.buckets[self.hashfn(dev, block)]
            .iter()
            .copied()
            .find(|&id| matches(id))
    }

    /// 所有桶中的元素个数
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut index = HashIndex::new(7);
        let dev = DeviceId::new(1, 0);
        // 块 3 与块 10 落在同一个桶
        index.insert(dev, 3, 30);
        index.insert(dev, 10, 100);
        assert_eq!(index.len(), 2);

        assert_eq!(index.find(dev, 10, |id| id == 100), Some(100));
        assert_eq!(index.find(dev, 3, |id| id == 30), Some(30));
        assert_eq!(index.find(dev, 4, |_| false), None);

        assert!(index.remove(dev, 10, 100));
        assert!(!index.remove(dev, 10, 100));
        assert_eq!(index.find(dev, 10, |id| id == 100), None);
    }

    #[test]
    fn test_device_spreads() {
        let index = HashIndex::new(997);
        let a = index.hashfn(DeviceId::new(1, 0), 10);
        let b = index.hashfn(DeviceId::new(1, 1), 10);
        assert_ne!(a, b);
        assert_eq!(index.nr_hash(), 997);
    }
}
