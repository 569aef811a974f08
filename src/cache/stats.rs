//! 缓存统计信息

use super::BufferCache;
use crate::consts::{NR_LIST, NR_SIZES};
use crate::types::{BlockSize, Disposition};

/// 某条处置链表的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListStats {
    /// 链表上的缓冲区数
    pub found: usize,
    /// 被引用的
    pub used: usize,
    /// 加锁的
    pub locked: usize,
    /// 脏的
    pub dirty: usize,
    /// 所在页被共享的
    pub shared: usize,
}

/// 某个块大小等级的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeStats {
    /// 块大小
    pub size: BlockSize,
    /// 该等级的缓冲区总数
    pub buffers: usize,
    /// 空闲链表长度
    pub free: usize,
    /// 负载均值（定点数，`FIXED_1` 为 1）
    pub lav: u64,
    /// 上次更新负载均值以来的使用次数
    pub usage: u64,
    /// 各处置链表上该等级的缓冲区数
    pub per_list: [usize; NR_LIST],
}

/// 缓存统计信息
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// 缓冲区占用的内存（字节）
    pub buffer_memory: usize,
    /// 分配过的描述符数
    pub buffer_heads: usize,
    /// 未使用的描述符数
    pub unused_heads: usize,
    /// 缓冲区总数
    pub nr_buffers: usize,
    /// 哈希桶数
    pub hash_buckets: usize,
    /// 缓存持有的页数
    pub pages: usize,
    /// `getblk` 命中次数
    pub hits: u64,
    /// `getblk` 未命中次数
    pub misses: u64,
    /// 刷新时提交的写请求数
    pub writebacks: u64,
    /// 按处置链表的统计
    pub lists: [ListStats; NR_LIST],
    /// 按块大小的统计
    pub sizes: [SizeStats; NR_SIZES],
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// 脏缓冲区数
    pub fn dirty(&self) -> usize {
        self.lists.iter().map(|l| l.dirty).sum()
    }
}

impl BufferCache {
    /// 统计信息快照
    pub fn stats(&self) -> CacheStats {
        let st = self.lock_state();
        let mut lists = [ListStats::default(); NR_LIST];
        for list in Disposition::ALL {
            let entry = &mut lists[list.index()];
            for id in st.lru[list.index()].iter() {
                let bh = st.head(id);
                entry.found += 1;
                entry.used += usize::from(bh.is_referenced());
                entry.locked += usize::from(bh.is_locked());
                entry.dirty += usize::from(bh.is_dirty());
                entry.shared += usize::from(st.is_shared(id));
            }
        }
        let sizes = BlockSize::ALL.map(|size| {
            let n = size.index();
            SizeStats {
                size,
                buffers: st.nr_buffers_size[n],
                free: st.free[n].len(),
                lav: st.buffers_lav[n],
                usage: st.buffer_usage[n],
                per_list: st.nr_buffers_st[n],
            }
        });
        CacheStats {
            buffer_memory: st.buffermem,
            buffer_heads: st.nr_buffer_heads(),
            unused_heads: st.nr_unused_heads(),
            nr_buffers: st.nr_buffers,
            hash_buckets: st.hash.nr_hash(),
            pages: st.nr_pages(),
            hits: st.hits,
            misses: st.misses,
            writebacks: st.writebacks,
            lists,
            sizes,
        }
    }

    /// 把统计信息写入日志
    pub fn show_buffers(&self) {
        let stats = self.stats();
        log::info!(
            "[BUFFER] buffer memory: {} KiB, buffer heads: {} ({} unused), buffers: {}, hash buckets: {}, hit rate: {:.2}",
            stats.buffer_memory / 1024,
            stats.buffer_heads,
            stats.unused_heads,
            stats.nr_buffers,
            stats.hash_buckets,
            stats.hit_rate()
        );
        for list in Disposition::ALL {
            let l = &stats.lists[list.index()];
            log::info!(
                "[BUFFER] {:>8}: {} buffers, {} used, {} locked, {} dirty, {} shared",
                list.name(),
                l.found,
                l.used,
                l.locked,
                l.dirty,
                l.shared
            );
        }
        for s in stats.sizes.iter().filter(|s| s.buffers > 0) {
            log::info!(
                "[BUFFER] size {} lav {} usage {} free {} lists {:?}",
                s.size.bytes(),
                s.lav,
                s.usage,
                s.free,
                s.per_list
            );
        }
    }
}
