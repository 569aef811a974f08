//! 缓冲区缓存模块
//!
//! 统一的块缓冲区缓存：所有上层对块设备的访问都经过这里。
//!
//! # 主要组件
//!
//! - [`BufferCache`] - 缓存上下文，持有全部结构与锁
//! - [`BufferHandle`] - 缓冲区的 RAII 引用，drop 时自动 `brelse`
//! - [`BufferFlags`] - 缓冲区状态标志
//! - [`CacheStats`] - 统计信息快照
//! - [`FsSync`] - 文件系统同步钩子（超级块、inode）
//! - [`SharedPage`] / [`PageData`] - `bread_page` 的结果
//!
//! # 结构
//!
//! | 结构 | 说明 |
//! |------|------|
//! | 描述符池 | `Vec<BufferHead>`，用 [`BufferId`] 索引，未使用的描述符回收复用 |
//! | 哈希索引 | (设备, 块号) → 描述符，桶数按内存分三档 |
//! | 空闲链表 | 每个块大小等级一条，挂未绑定的描述符 |
//! | 处置链表 | CLEAN / UNSHARED / LOCKED / LOCKED1 / DIRTY / SHARED |
//! | 页表 | 每页记录切分出的兄弟描述符，整页空闲时才归还 |
//!
//! # 并发
//!
//! 上述结构由一把结构锁保护。等待缓冲区解锁、等待空闲缓冲区都用条件变量实现。
//! 请求层有自己的锁，两把锁从不同时持有；调用驱动和文件系统钩子时不持有任何缓存锁。
//! 页内容由页自己的锁保护，加锁顺序为 结构锁 → 页锁。
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bcache_core::{BufferCache, CacheConfig, DeviceId, FixedPagePool, RamDisk, SystemClock};
//!
//! let pool = Arc::new(FixedPagePool::with_memory(8 * 1024 * 1024));
//! let cache = BufferCache::new(pool, Arc::new(SystemClock::new()), CacheConfig::default())?;
//! cache.register_driver(3, Arc::new(RamDisk::new(8192)));
//!
//! let dev = DeviceId::new(3, 0);
//! if let Some(bh) = cache.bread(dev, 10, 1024)? {
//!     bh.with_data_mut(|data| data[0] = 0x42);
//! } // drop 时 brelse
//!
//! cache.fsync_dev(dev)?;
//! ```

mod access;
mod buffer;
mod cluster;
mod grow;
mod handle;
mod hash;
mod lists;
mod state;
mod stats;
mod sync;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

pub use buffer::BufferFlags;
pub use cluster::{PageData, SharedPage};
pub use handle::BufferHandle;
pub use stats::{CacheStats, ListStats, SizeStats};
pub use sync::FsSync;

pub(crate) use state::CacheState;

use crate::bdflush::BdflushControl;
use crate::block::RequestLayer;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::consts::PAGE_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::page::{Gfp, PageAllocator};
use crate::types::{BlockSize, BufferId};

/// 缓冲区缓存
///
/// 缓存上下文对象：哈希表、链表、参数表都是它的字段，所有操作都通过它进行。
/// 需要启动 bdflush 守护线程时用 `Arc<BufferCache>`。
pub struct BufferCache {
    pub(crate) config: CacheConfig,
    pub(crate) allocator: Arc<dyn PageAllocator>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    /// 任意缓冲区解锁时通知
    buffer_unlocked: Condvar,
    /// 有缓冲区引用计数归零或缓存增长时通知
    buffer_wait: Condvar,
    pub(crate) blk: RequestLayer,
    pub(crate) bdflush: BdflushControl,
    fs_sync: RwLock<Option<Arc<dyn FsSync>>>,
}

impl BufferCache {
    /// 创建缓存
    ///
    /// 哈希桶数按页分配器的总内存选择，并预先切分一页 1024 字节的缓冲区。
    ///
    /// # 参数
    ///
    /// * `allocator` - 页分配器
    /// * `clock` - 时钟
    /// * `config` - 配置
    ///
    /// # 返回
    ///
    /// 配置无效时返回 `InvalidInput`，连第一页都分配不到时返回 `NoSpace`
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        let memory = allocator.total_pages() * PAGE_SIZE;
        let nr_hash = config.hash_size(memory);
        let cache = Self {
            config,
            allocator,
            clock,
            state: Mutex::new(CacheState::new(nr_hash, config.bdflush)),
            buffer_unlocked: Condvar::new(),
            buffer_wait: Condvar::new(),
            blk: RequestLayer::new(config.nr_requests),
            bdflush: BdflushControl::new(),
            fs_sync: RwLock::new(None),
        };
        let grown = {
            let mut st = cache.lock_state();
            cache.grow_buffers(&mut st, Gfp::Kernel, BlockSize::B1024)
        };
        if !grown {
            log::error!("[BUFFER] unable to initialize buffer free list");
            return Err(Error::new(ErrorKind::NoSpace, "unable to initialize buffer free list"));
        }
        log::info!("[BUFFER] buffer cache initialized: {} hash buckets, {} bytes of memory", nr_hash, memory);
        Ok(cache)
    }

    /// 配置
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 安装文件系统同步钩子
    pub fn set_fs_sync(&self, hooks: Arc<dyn FsSync>) {
        *self.fs_sync.write().unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    pub(crate) fn fs_sync(&self) -> Option<Arc<dyn FsSync>> {
        self.fs_sync.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 当前节拍
    pub(crate) fn now(&self) -> u64 {
        self.clock.jiffies()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 释放结构锁；期间有脏缓冲区越过阈值时唤醒 bdflush
    pub(crate) fn release_state(&self, mut st: MutexGuard<'_, CacheState>) {
        let wake = core::mem::take(&mut st.wake_bdflush);
        drop(st);
        if wake {
            self.wakeup_bdflush(false);
        }
    }

    /// 等待缓冲区解锁
    ///
    /// 等待期间持有一个引用，防止缓冲区被回收。返回后调用者需要重新检查身份。
    pub(crate) fn wait_on_buffer<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        id: BufferId,
    ) -> MutexGuard<'a, CacheState> {
        if !st.head(id).is_locked() {
            return st;
        }
        st.head_mut(id).get();
        while st.head(id).is_locked() {
            st = self.buffer_unlocked.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        self.unpin(&mut st, id);
        st
    }

    /// 清除加锁标志并唤醒等待者
    pub(crate) fn unlock_buffer(&self, st: &mut CacheState, id: BufferId) {
        st.head_mut(id).flags.remove(BufferFlags::LOCKED);
        self.buffer_unlocked.notify_all();
    }

    /// 释放一个临时引用（不等待、不重新归档）
    pub(crate) fn unpin(&self, st: &mut CacheState, id: BufferId) {
        if st.head_mut(id).put() && st.head(id).count == 0 {
            self.buffer_wait.notify_all();
        }
    }

    /// 检查缓存结构的全部不变式，违反时 panic
    pub fn check_consistency(&self) {
        self.lock_state().check_invariants();
    }
}
