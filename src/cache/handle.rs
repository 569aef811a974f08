//! 缓冲区句柄 - RAII 风格的缓冲区访问
//!
//! `getblk` / `bread` / `breada` 返回 [`BufferHandle`]。句柄持有缓冲区的一个引用，
//! drop 时执行 `brelse`：等待 I/O 结束、计算刷新期限、重新归档、引用减一。

use core::fmt;

use super::BufferCache;
use crate::types::{BlockSize, BufferId, DeviceId};

/// 缓冲区句柄
///
/// 句柄存活期间缓冲区不会被回收，也不会改变身份。
///
/// # 示例
///
/// ```rust,ignore
/// // 读取块
/// let bh = cache.bread(dev, 1, 1024)?.ok_or(Error::new(ErrorKind::Io, "read failed"))?;
/// let magic = bh.with_data(|data| u16::from_le_bytes([data[56], data[57]]));
///
/// // 覆盖整个块，不需要先读
/// let bh = cache.getblk(dev, 20, 1024)?;
/// bh.with_data_mut(|data| data.fill(0));
/// bh.mark_uptodate();
/// // bh 超出作用域时自动 brelse，脏块由 bdflush 写回
/// ```
pub struct BufferHandle<'a> {
    cache: &'a BufferCache,
    id: BufferId,
}

impl<'a> BufferHandle<'a> {
    /// 包装一个已经持有引用的缓冲区
    pub(crate) fn new(cache: &'a BufferCache, id: BufferId) -> Self {
        Self { cache, id }
    }

    /// 描述符索引
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// 交出引用而不执行 `brelse`，由调用者负责释放
    pub(crate) fn into_id(self) -> BufferId {
        let id = self.id;
        core::mem::forget(self);
        id
    }

    /// 所属缓存
    pub fn cache(&self) -> &'a BufferCache {
        self.cache
    }

    /// 设备号
    pub fn dev(&self) -> DeviceId {
        let st = self.cache.lock_state();
        match st.head(self.id).dev {
            Some(dev) => dev,
            None => panic!("referenced buffer {} lost its device", self.id),
        }
    }

    /// 块号
    pub fn blocknr(&self) -> u64 {
        self.cache.lock_state().head(self.id).blocknr
    }

    /// 块大小
    pub fn size(&self) -> BlockSize {
        self.cache.lock_state().head(self.id).size
    }

    /// 数据是否有效
    pub fn is_uptodate(&self) -> bool {
        self.cache.lock_state().head(self.id).is_uptodate()
    }

    /// 是否为脏
    pub fn is_dirty(&self) -> bool {
        self.cache.lock_state().head(self.id).is_dirty()
    }

    /// 是否有 I/O 进行中
    pub fn is_locked(&self) -> bool {
        self.cache.lock_state().head(self.id).is_locked()
    }

    /// 当前引用计数
    pub fn count(&self) -> u32 {
        self.cache.lock_state().head(self.id).count
    }

    /// 等待进行中的 I/O 结束
    pub fn wait(&self) {
        let st = self.cache.lock_state();
        let st = self.cache.wait_on_buffer(st, self.id);
        drop(st);
    }

    /// 读取缓冲区内容
    pub fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.cache.with_buffer_data(self.id, f)
    }

    /// 修改缓冲区内容并标记为脏
    ///
    /// 先等待进行中的 I/O 结束；闭包在缓存结构锁下执行，不得回调缓存。
    pub fn with_data_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.cache.with_buffer_data_mut(self.id, f)
    }

    /// 标记为脏
    pub fn mark_dirty(&self) {
        self.cache.mark_buffer_dirty(self.id, false);
    }

    /// 标记为脏，使用超级块的老化时间
    pub fn mark_dirty_super(&self) {
        self.cache.mark_buffer_dirty(self.id, true);
    }

    /// 标记数据有效（调用者已经填满了整个块）
    pub fn mark_uptodate(&self) {
        self.cache.mark_buffer_uptodate(self.id, true);
    }

    /// 释放缓冲区
    pub fn brelse(self) {}
}

impl fmt::Debug for BufferHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle").field("id", &self.id).finish()
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        self.cache.brelse_id(self.id);
    }
}
