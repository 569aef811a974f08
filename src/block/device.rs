//! 块设备驱动接口与设备表

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::BufferCache;
use crate::types::{BlockSize, DeviceId};

/// 块设备驱动接口
///
/// 每个主设备号注册一个驱动。请求入队后缓存调用 `request_fn` 启动驱动，
/// 调用时不持有任何缓存锁。驱动从 [`BufferCache::current_request`] 取出队列头，
/// 用 [`BufferCache::with_io_buffer`] / [`BufferCache::with_io_buffer_mut`] 搬运数据
/// （页请求没有缓冲区，数据在 [`RequestInfo::page`](super::RequestInfo::page) 里），
/// 最后调用 [`BufferCache::end_request`] 完成请求。驱动可以在 `request_fn`
/// 中同步完成，也可以之后在别的线程里完成（模拟中断）。
///
/// # 示例
///
/// ```rust,ignore
/// struct NullDisk;
///
/// impl BlockDriver for NullDisk {
///     fn request_fn(&self, cache: &BufferCache, major: u8) {
///         while let Some(req) = cache.current_request(major) {
///             if req.cmd == Command::Read {
///                 for &id in &req.buffers {
///                     cache.with_io_buffer_mut(id, |data| data.fill(0));
///                 }
///                 if let Some(page) = &req.page {
///                     page.with_data_mut(|data| data.fill(0));
///                 }
///             }
///             cache.end_request(major, true);
///         }
///     }
/// }
/// ```
pub trait BlockDriver: Send + Sync {
    /// 队列中有新请求
    ///
    /// # 参数
    ///
    /// * `cache` - 请求所属的缓存
    /// * `major` - 主设备号
    fn request_fn(&self, cache: &BufferCache, major: u8);

    /// 预读扇区数；`None` 时使用配置中的默认值
    fn read_ahead(&self) -> Option<u32> {
        None
    }
}

/// 每个设备的属性表
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    blksize: BTreeMap<DeviceId, BlockSize>,
    size_kb: BTreeMap<DeviceId, u64>,
    read_only: BTreeSet<DeviceId>,
    read_ahead: BTreeMap<u8, u32>,
}

impl DeviceTable {
    pub fn block_size(&self, dev: DeviceId) -> Option<BlockSize> {
        self.blksize.get(&dev).copied()
    }

    pub fn set_block_size(&mut self, dev: DeviceId, size: BlockSize) {
        self.blksize.insert(dev, size);
    }

    /// 设备大小（扇区），未声明时为 `None`
    pub fn size_sectors(&self, dev: DeviceId) -> Option<u64> {
        self.size_kb.get(&dev).map(|kb| kb.saturating_mul(2))
    }

    pub fn set_size_kb(&mut self, dev: DeviceId, kb: u64) {
        self.size_kb.insert(dev, kb);
    }

    pub fn is_read_only(&self, dev: DeviceId) -> bool {
        self.read_only.contains(&dev)
    }

    pub fn set_read_only(&mut self, dev: DeviceId, ro: bool) {
        if ro {
            self.read_only.insert(dev);
        } else {
            self.read_only.remove(&dev);
        }
    }

    pub fn read_ahead(&self, major: u8) -> u32 {
        self.read_ahead.get(&major).copied().unwrap_or(0)
    }

    pub fn set_read_ahead(&mut self, major: u8, sectors: u32) {
        self.read_ahead.insert(major, sectors);
    }
}
