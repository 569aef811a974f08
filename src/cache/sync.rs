//! 同步、失效与块大小协商
//!
//! - `sync_buffers`: 三遍扫描写出脏缓冲区
//! - `sync_dev` / `fsync_dev`: 连同文件系统钩子一起同步整个设备
//! - `invalidate_buffers`: 可移动设备更换介质后丢弃缓存内容
//! - `set_block_size`: 改变设备的缓存单位

use std::collections::BTreeMap;

use super::{BufferCache, BufferFlags};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockSize, BufferId, DeviceId, Disposition, RwMode};

/// 文件系统同步钩子
///
/// 缓存本身不知道超级块和 inode 在哪里；文件系统层实现这个 trait，
/// 在 `sync_dev`、`fsync_dev` 和 bdflush 的周期同步中被调用。
/// 调用时不持有任何缓存锁，钩子可以自由地使用 `getblk` / `bread`。
pub trait FsSync: Send + Sync {
    /// 把脏超级块写入缓冲区缓存
    fn sync_supers(&self, cache: &BufferCache, dev: Option<DeviceId>);

    /// 把脏 inode 写入缓冲区缓存
    fn sync_inodes(&self, cache: &BufferCache, dev: Option<DeviceId>);
}

impl BufferCache {
    /// 写出脏缓冲区
    ///
    /// 第 0 遍只写没有加锁的脏缓冲区；第 1 遍等待加锁的缓冲区后再写；
    /// 第 2 遍只等待。`wait` 为 `false` 时只做第 0 遍。
    ///
    /// # 参数
    ///
    /// * `dev` - 只同步该设备；`None` 表示全部设备
    /// * `wait` - 是否等待写完成
    ///
    /// # 返回
    ///
    /// `wait` 时发现请求过但仍然无效的缓冲区（读写失败）返回 `Io`
    pub fn sync_buffers(&self, dev: Option<DeviceId>, wait: bool) -> Result<()> {
        let mut failed = false;
        let mut pass = 0u32;
        loop {
            let mut retry = false;
            let mut pending: Vec<BufferId> = Vec::new();
            let mut st = self.lock_state();
            for list in Disposition::ALL {
                let snapshot = st.lru[list.index()].snapshot(usize::MAX);
                for id in snapshot {
                    let bh = st.head(id);
                    if !bh.is_bound() || bh.list != list || dev.is_some_and(|d| bh.dev != Some(d)) {
                        continue;
                    }
                    if bh.is_locked() {
                        if !wait || pass == 0 {
                            retry = true;
                            continue;
                        }
                        // 等待之前先把攒下的写请求发出去
                        drop(st);
                        self.write_and_unpin(&mut pending);
                        st = self.lock_state();
                        st = self.wait_on_buffer(st, id);
                    }
                    let bh = st.head(id);
                    if !bh.is_bound() || dev.is_some_and(|d| bh.dev != Some(d)) || bh.is_locked() {
                        continue;
                    }
                    if wait
                        && bh.flags.contains(BufferFlags::REQ)
                        && !bh.is_dirty()
                        && !bh.is_uptodate()
                    {
                        log::error!("[BUFFER] I/O error on block {} of {:?}", bh.blocknr, bh.dev);
                        failed = true;
                        continue;
                    }
                    if !bh.is_dirty() || pass >= 2 {
                        continue;
                    }
                    let bh = st.head_mut(id);
                    bh.get();
                    bh.flushtime = 0;
                    pending.push(id);
                    retry = true;
                }
            }
            drop(st);
            self.write_and_unpin(&mut pending);

            if wait && retry && pass < 2 {
                pass += 1;
                continue;
            }
            break;
        }
        if failed {
            Err(Error::new(ErrorKind::Io, "buffer write-back reported an I/O error"))
        } else {
            Ok(())
        }
    }

    /// 按设备分组提交写请求，然后释放扫描时取得的引用
    pub(crate) fn write_and_unpin(&self, pending: &mut Vec<BufferId>) {
        if pending.is_empty() {
            return;
        }
        let ids = core::mem::take(pending);
        let mut by_dev: BTreeMap<DeviceId, Vec<BufferId>> = BTreeMap::new();
        {
            let st = self.lock_state();
            for &id in &ids {
                if let Some(dev) = st.head(id).dev {
                    by_dev.entry(dev).or_default().push(id);
                }
            }
        }
        for (dev, batch) in &by_dev {
            if let Err(e) = self.submit(RwMode::Write, batch) {
                log::warn!("[BUFFER] write-back to {} failed: {}", dev, e);
            }
        }
        let mut st = self.lock_state();
        st.writebacks += ids.len() as u64;
        for id in ids {
            self.unpin(&mut st, id);
        }
        drop(st);
    }

    /// 异步同步设备：写出脏缓冲区，调用文件系统钩子，再写一遍
    pub fn sync_dev(&self, dev: Option<DeviceId>) -> Result<()> {
        let first = self.sync_buffers(dev, false);
        self.run_fs_sync(dev);
        let second = self.sync_buffers(dev, false);
        first.and(second)
    }

    /// 同步设备并等待全部写完成
    ///
    /// # 返回
    ///
    /// 有缓冲区读写失败时返回 `Io`
    pub fn fsync_dev(&self, dev: DeviceId) -> Result<()> {
        let first = self.sync_buffers(Some(dev), false);
        self.run_fs_sync(Some(dev));
        let second = self.sync_buffers(Some(dev), true);
        log::debug!("[BUFFER] fsync of {} complete", dev);
        first.and(second)
    }

    pub(crate) fn run_fs_sync(&self, dev: Option<DeviceId>) {
        if let Some(hooks) = self.fs_sync() {
            hooks.sync_supers(self, dev);
            hooks.sync_inodes(self, dev);
        }
    }

    /// 丢弃设备的缓存内容
    ///
    /// 等待每个缓冲区的 I/O 结束；仍被引用的缓冲区保持不动，
    /// 其余的清除全部状态并放回空闲链表。脏数据不会写回。
    pub fn invalidate_buffers(&self, dev: DeviceId) {
        let mut st = self.lock_state();
        let mut dropped = 0usize;
        for list in Disposition::ALL {
            let snapshot = st.lru[list.index()].snapshot(usize::MAX);
            for id in snapshot {
                if !st.head(id).is_bound() || st.head(id).dev != Some(dev) {
                    continue;
                }
                st = self.wait_on_buffer(st, id);
                let bh = st.head(id);
                if !bh.is_bound() || bh.dev != Some(dev) || bh.count > 0 {
                    continue;
                }
                let bh = st.head_mut(id);
                bh.flushtime = 0;
                bh.flags.remove(BufferFlags::UPTODATE | BufferFlags::DIRTY | BufferFlags::REQ);
                st.remove_from_queues(id);
                st.put_last_free(id);
                dropped += 1;
            }
        }
        drop(st);
        log::info!("[BUFFER] invalidated {} buffers of {}", dropped, dev);
    }

    /// 设备当前的块大小（未设置时为 1024）
    pub fn block_size(&self, dev: DeviceId) -> BlockSize {
        self.blk.block_size(dev).unwrap_or_default()
    }

    /// 改变设备的块大小
    ///
    /// 大小不变（或第一次设置为默认的 1024）时只做记录。否则先同步写出设备的
    /// 全部脏缓冲区，记录新的大小，然后丢弃旧大小的缓存内容：
    /// 未被引用的放回空闲链表，仍被引用的清除状态并从哈希中摘除。
    ///
    /// # 返回
    ///
    /// 不支持的块大小返回 `InvalidInput`
    pub fn set_block_size(&self, dev: DeviceId, size: usize) -> Result<()> {
        let Some(size) = BlockSize::from_bytes(size) else {
            log::error!("[BUFFER] set_block_size: invalid block size {} for {}", size, dev);
            return Err(Error::new(ErrorKind::InvalidInput, "unsupported block size"));
        };
        let current = self.blk.block_size(dev);
        if current == Some(size) || (current.is_none() && size == BlockSize::default()) {
            self.blk.set_block_size(dev, size);
            return Ok(());
        }

        if let Err(e) = self.sync_buffers(Some(dev), true) {
            log::error!("[BUFFER] set_block_size: flush of {} failed: {}", dev, e);
        }
        self.blk.set_block_size(dev, size);
        log::info!("[BUFFER] block size of {} set to {}", dev, size.bytes());

        let mut st = self.lock_state();
        let now = self.now();
        for list in Disposition::ALL {
            let snapshot = st.lru[list.index()].snapshot(usize::MAX);
            for id in snapshot {
                let bh = st.head(id);
                if !bh.is_bound() || bh.dev != Some(dev) || bh.size == size {
                    continue;
                }
                st = self.wait_on_buffer(st, id);
                let bh = st.head(id);
                if !bh.is_bound() || bh.dev != Some(dev) || bh.size == size {
                    continue;
                }
                st.mark_clean(id, now);
                let bh = st.head_mut(id);
                bh.flushtime = 0;
                bh.flags.remove(BufferFlags::UPTODATE | BufferFlags::REQ);
                if bh.count == 0 {
                    st.remove_from_queues(id);
                    st.put_last_free(id);
                } else {
                    st.remove_from_hash(id);
                }
            }
        }
        drop(st);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cache::tests::{fixture, ramdisk_cache};

    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl FsSync for Recorder {
        fn sync_supers(&self, cache: &BufferCache, dev: Option<DeviceId>) {
            self.calls.lock().unwrap().push("supers");
            // 钩子里可以回调缓存
            let bh = cache.getblk(dev.unwrap(), 1, 1024).unwrap();
            bh.with_data_mut(|data| data[0] = 0x53);
            bh.mark_uptodate();
        }

        fn sync_inodes(&self, _cache: &BufferCache, _dev: Option<DeviceId>) {
            self.calls.lock().unwrap().push("inodes");
        }
    }

    #[test]
    fn test_fsync_runs_hooks_and_writes() {
        let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
        let recorder = Arc::new(Recorder { calls: Mutex::new(Vec::new()) });
        cache.set_fs_sync(recorder.clone());

        cache.fsync_dev(dev).unwrap();
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["supers", "inodes"]);
        // 钩子写入的超级块在第二遍中写出
        assert_eq!(disk.read_sectors(dev, 2, 1)[0], 0x53);
        let bh = cache.get_hash_table(dev, 1, 1024).unwrap().unwrap();
        assert!(!bh.is_dirty());
    }

    #[test]
    fn test_sync_buffers_reports_io_error() {
        let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
        disk.fail_sector(dev, 10);

        // 写失败：缓冲区重新变脏，留给下一次同步
        {
            let bh = cache.getblk(dev, 5, 1024).unwrap();
            bh.with_data_mut(|data| data.fill(1));
            bh.mark_uptodate();
        }
        assert!(cache.sync_buffers(Some(dev), false).is_ok());
        assert!(cache.get_hash_table(dev, 5, 1024).unwrap().unwrap().is_dirty());
        cache.invalidate_buffers(dev);

        // 读失败：请求过但无效，等待式同步报告 I/O 错误
        assert!(cache.bread(dev, 5, 1024).unwrap().is_none());
        let err = cache.sync_buffers(Some(dev), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_invalidate_skips_referenced() {
        let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
        let held = cache.bread(dev, 3, 1024).unwrap().unwrap();
        drop(cache.bread(dev, 4, 1024).unwrap().unwrap());

        cache.invalidate_buffers(dev);
        assert!(cache.get_hash_table(dev, 4, 1024).unwrap().is_none());
        assert!(held.is_uptodate());
        drop(held);
        assert!(cache.get_hash_table(dev, 3, 1024).unwrap().is_some());
        cache.check_consistency();
    }

    #[test]
    fn test_set_block_size() {
        let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
        assert!(cache.set_block_size(dev, 1000).is_err());
        cache.set_block_size(dev, 1024).unwrap();
        assert_eq!(cache.block_size(dev), BlockSize::B1024);

        drop(cache.bread(dev, 2, 1024).unwrap().unwrap());
        let held = cache.bread(dev, 3, 1024).unwrap().unwrap();
        cache.set_block_size(dev, 2048).unwrap();
        assert_eq!(cache.block_size(dev), BlockSize::B2048);

        // 旧大小的缓冲区全部从哈希中消失，引用中的那个也不例外
        assert!(cache.get_hash_table(dev, 2, 1024).unwrap().is_none());
        assert!(cache.get_hash_table(dev, 3, 1024).unwrap().is_none());
        assert!(!held.is_uptodate());
        drop(held);
        cache.check_consistency();

        let bh = cache.bread(dev, 1, 2048).unwrap().unwrap();
        assert_eq!(bh.size(), BlockSize::B2048);
    }
}
