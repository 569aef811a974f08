//! 缓存配置

use std::time::Duration;

use crate::bdflush::BdflushParams;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};

/// 缓冲区缓存配置
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// 哈希桶数（`None` 时按页分配器的总内存选择）
    pub nr_hash: Option<usize>,
    /// 空闲缓冲区超过此值时不再补充
    pub refill_threshold: usize,
    /// 重组簇之前把空闲链表填充到的数量
    pub cluster_free_target: usize,
    /// 请求池大小（写请求只能使用前 2/3）
    pub nr_requests: usize,
    /// 单个请求合并后的最大扇区数
    pub max_merge_sectors: u32,
    /// `breada` 一次最多处理的块数
    pub max_readahead: usize,
    /// 注册驱动时的默认预读扇区数
    pub default_read_ahead: u32,
    /// bdflush 初始参数
    pub bdflush: BdflushParams,
    /// bdflush 周期性调用 `sync_old_buffers` 的间隔
    pub update_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nr_hash: None,
            refill_threshold: REFILL_THRESHOLD,
            cluster_free_target: CLUSTER_FREE_TARGET,
            nr_requests: NR_REQUEST,
            max_merge_sectors: MAX_MERGE_SECTORS,
            max_readahead: NBUF,
            default_read_ahead: DEFAULT_READ_AHEAD,
            bdflush: BdflushParams::default(),
            update_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl CacheConfig {
    /// 检查配置
    pub fn validate(&self) -> Result<()> {
        if self.nr_hash == Some(0) {
            return Err(Error::new(ErrorKind::InvalidInput, "hash table needs at least one bucket"));
        }
        // 写请求只能用前 2/3，至少要留一个
        if self.nr_requests < 3 {
            return Err(Error::new(ErrorKind::InvalidInput, "request pool needs at least 3 slots"));
        }
        if self.max_readahead == 0 || self.max_readahead > NBUF {
            return Err(Error::new(ErrorKind::InvalidInput, "read-ahead run length out of range"));
        }
        self.bdflush.validate()
    }

    /// 根据内存大小选择哈希桶数
    pub fn hash_size(&self, memory_bytes: usize) -> usize {
        match self.nr_hash {
            Some(n) => n,
            None if memory_bytes < HASH_TIER_SMALL => NR_HASH_SMALL,
            None if memory_bytes < HASH_TIER_MEDIUM => NR_HASH_MEDIUM,
            None => NR_HASH_LARGE,
        }
    }
}
