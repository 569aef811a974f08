//! 访问接口：getblk / bread / breada / brelse / 标记脏
//!
//! 所有上层访问块设备的入口。`getblk` 永远不会因为缺少内存而失败，
//! 它会补充空闲链表、回收缓冲区、唤醒 bdflush，直到拿到一个描述符为止。

use std::ops::Range;
use std::sync::{Arc, MutexGuard};

use super::{BufferCache, BufferFlags, BufferHandle, CacheState};
use crate::page::PageFrame;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockSize, BufferId, DeviceId, RwMode};

pub(crate) fn block_size(size: usize) -> Result<BlockSize> {
    BlockSize::from_bytes(size).ok_or_else(|| {
        log::error!("[BUFFER] unsupported block size {}", size);
        Error::new(ErrorKind::InvalidInput, "unsupported block size")
    })
}

impl BufferCache {
    /// 获取 (dev, block) 的缓冲区
    ///
    /// 命中时复用已有描述符；否则从空闲链表取一个（必要时补充空闲链表），
    /// 绑定身份后放入 CLEAN 链表。返回的缓冲区不保证数据有效。
    ///
    /// # 参数
    ///
    /// * `dev` - 设备号
    /// * `block` - 块号
    /// * `size` - 块大小（512、1024、2048 或 4096）
    ///
    /// # 返回
    ///
    /// - `InvalidInput` - 不支持的块大小
    /// - `Corrupted` - 该块已经以另一种块大小缓存
    pub fn getblk(&self, dev: DeviceId, block: u64, size: usize) -> Result<BufferHandle<'_>> {
        let size = block_size(size)?;
        let id = self.getblk_id(dev, block, size)?;
        Ok(BufferHandle::new(self, id))
    }

    pub(crate) fn getblk_id(&self, dev: DeviceId, block: u64, size: BlockSize) -> Result<BufferId> {
        let isize = size.index();
        let mut st = self.lock_state();
        st.buffer_usage[isize] += 1;
        loop {
            let (guard, found) = self.get_hash_table_locked(st, dev, block, size);
            st = guard;
            if let Some(id) = found? {
                st.hits += 1;
                let bh = st.head(id);
                let (uptodate, dirty) = (bh.is_uptodate(), bh.is_dirty());
                if uptodate && !dirty {
                    st.put_last_lru(id);
                }
                if !dirty {
                    st.head_mut(id).flushtime = 0;
                }
                log::trace!("[BUFFER] getblk hit: dev={} block={} id={}", dev, block, id);
                self.release_state(st);
                return Ok(id);
            }

            while st.free[isize].is_empty() {
                st = self.refill_freelist(st, size);
            }

            // 补充空闲链表期间可能释放过锁，别人可能已经建立了同一个块
            if st.find_buffer(dev, block, size)?.is_some() {
                continue;
            }

            let Some(id) = st.free[isize].front() else {
                continue;
            };
            st.remove_from_free_list(id);
            st.head_mut(id).bind(dev, block);
            st.insert_into_queues(id);
            st.misses += 1;
            log::trace!("[BUFFER] getblk miss: dev={} block={} id={}", dev, block, id);
            self.release_state(st);
            return Ok(id);
        }
    }

    /// 只查找，不分配
    ///
    /// # 返回
    ///
    /// 缓存中没有该块时返回 `Ok(None)`
    pub fn get_hash_table(&self, dev: DeviceId, block: u64, size: usize) -> Result<Option<BufferHandle<'_>>> {
        let size = block_size(size)?;
        let st = self.lock_state();
        let (st, found) = self.get_hash_table_locked(st, dev, block, size);
        self.release_state(st);
        Ok(found?.map(|id| BufferHandle::new(self, id)))
    }

    /// 查找并取得引用；缓冲区加锁时等待，醒来后重新核对身份
    fn get_hash_table_locked<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        dev: DeviceId,
        block: u64,
        size: BlockSize,
    ) -> (MutexGuard<'a, CacheState>, Result<Option<BufferId>>) {
        loop {
            let id = match st.find_buffer(dev, block, size) {
                Ok(Some(id)) => id,
                other => return (st, other),
            };
            st.head_mut(id).get();
            st = self.wait_on_buffer(st, id);
            let bh = st.head(id);
            if bh.matches(dev, block) && bh.hashed && bh.size == size {
                return (st, Ok(Some(id)));
            }
            self.unpin(&mut st, id);
        }
    }

    /// 读取块
    ///
    /// # 返回
    ///
    /// - `Ok(Some(_))` - 数据有效的缓冲区
    /// - `Ok(None)` - 读失败（I/O 错误）
    /// - `Err(_)` - 参数或设备错误
    pub fn bread(&self, dev: DeviceId, block: u64, size: usize) -> Result<Option<BufferHandle<'_>>> {
        let bh = self.getblk(dev, block, size)?;
        if bh.is_uptodate() {
            return Ok(Some(bh));
        }
        self.ll_rw_block(RwMode::Read, &[&bh])?;
        bh.wait();
        if bh.is_uptodate() {
            Ok(Some(bh))
        } else {
            log::warn!("[BUFFER] bread failed: dev={} block={}", dev, block);
            Ok(None)
        }
    }

    /// 读取块并预读后续的块
    ///
    /// 预读长度为文件剩余的块数，受设备预读扇区数和 `max_readahead` 限制。
    /// 遇到已经有效的块时停止。只等待第一个块完成。
    ///
    /// # 参数
    ///
    /// * `pos` - 当前读取位置（字节）
    /// * `filesize` - 文件大小（字节）
    pub fn breada(
        &self,
        dev: DeviceId,
        block: u64,
        size: usize,
        pos: u64,
        filesize: u64,
    ) -> Result<Option<BufferHandle<'_>>> {
        let bsize = block_size(size)?;
        if pos >= filesize {
            return Ok(None);
        }
        let bh = self.getblk(dev, block, size)?;
        if bh.is_uptodate() {
            return Ok(Some(bh));
        }

        let ra_blocks = (self.read_ahead(dev.major()) >> bsize.index()) as usize;
        let blocks = (filesize - pos)
            .div_ceil(size as u64)
            .min(ra_blocks as u64)
            .min(self.config.max_readahead as u64) as usize;

        let mut bufs = vec![bh];
        for i in 1..blocks {
            let Some(next) = block.checked_add(i as u64) else {
                break;
            };
            let extra = self.getblk(dev, next, size)?;
            if extra.is_uptodate() {
                break;
            }
            bufs.push(extra);
        }
        log::trace!("[BUFFER] breada: dev={} block={} run={}", dev, block, bufs.len());

        let refs: Vec<&BufferHandle<'_>> = bufs.iter().collect();
        self.ll_rw_block(RwMode::Read, &refs)?;

        let mut bufs = bufs.into_iter();
        let Some(bh) = bufs.next() else {
            return Ok(None);
        };
        for extra in bufs {
            self.put_nowait(extra.into_id());
        }
        bh.wait();
        if bh.is_uptodate() {
            Ok(Some(bh))
        } else {
            log::warn!("[BUFFER] breada failed: dev={} block={}", dev, block);
            Ok(None)
        }
    }

    /// 释放一个引用
    ///
    /// 等待进行中的 I/O，计算刷新期限并重新归档，最后引用减一。
    /// 对引用计数为 0 的缓冲区调用是调用者错误，只记录日志。
    pub(crate) fn brelse_id(&self, id: BufferId) {
        let st = self.lock_state();
        let mut st = self.wait_on_buffer(st, id);
        if st.head(id).count == 0 {
            log::error!("[BUFFER] trying to free free buffer {}", id);
            self.release_state(st);
            return;
        }
        let now = self.now();
        st.set_writetime(id, false, now);
        if st.head(id).is_bound() {
            st.refile(id, now);
        }
        self.unpin(&mut st, id);
        self.release_state(st);
    }

    /// 引用减一，不等待 I/O
    pub(crate) fn put_nowait(&self, id: BufferId) {
        let mut st = self.lock_state();
        if st.head(id).count == 0 {
            log::error!("[BUFFER] trying to free free buffer {}", id);
        } else {
            self.unpin(&mut st, id);
        }
        drop(st);
    }

    /// 标记为脏
    ///
    /// 第一次变脏时计算刷新期限（`is_super` 时用超级块的老化时间）并重新归档
    pub(crate) fn mark_buffer_dirty(&self, id: BufferId, is_super: bool) {
        let mut st = self.lock_state();
        self.mark_dirty_locked(&mut st, id, is_super);
        self.release_state(st);
    }

    pub(crate) fn mark_dirty_locked(&self, st: &mut CacheState, id: BufferId, is_super: bool) {
        if st.head(id).is_dirty() {
            return;
        }
        let now = self.now();
        st.head_mut(id).flags.insert(BufferFlags::DIRTY);
        st.set_writetime(id, is_super, now);
        if st.head(id).is_bound() {
            st.refile(id, now);
        }
    }

    /// 设置或清除数据有效标志
    pub(crate) fn mark_buffer_uptodate(&self, id: BufferId, on: bool) {
        let mut st = self.lock_state();
        st.head_mut(id).flags.set(BufferFlags::UPTODATE, on);
    }

    //=========================================================================
    // 数据访问
    //=========================================================================

    pub(crate) fn with_buffer_data<F, R>(&self, id: BufferId, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let (frame, range) = {
            let st = self.lock_state();
            let bh = st.head(id);
            (st.frame(id).clone(), bh.offset..bh.offset + bh.size.bytes())
        };
        let bytes = frame.bytes();
        f(&bytes[range])
    }

    pub(crate) fn with_buffer_data_mut<F, R>(&self, id: BufferId, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let st = self.lock_state();
        let mut st = self.wait_on_buffer(st, id);
        let bh = st.head(id);
        let range = bh.offset..bh.offset + bh.size.bytes();
        let frame = st.frame(id).clone();
        let result = {
            let mut bytes = frame.bytes();
            f(&mut bytes[range])
        };
        self.mark_dirty_locked(&mut st, id, false);
        self.release_state(st);
        result
    }

    /// 驱动读取缓冲区内容（写请求时使用）
    ///
    /// 缓冲区在请求完成前一直处于加锁状态，驱动独占访问。
    ///
    /// # 返回
    ///
    /// `id` 不是一个正在传输的缓冲区（越界、未绑定或没有加锁）时为 `None`，
    /// 驱动应当以 I/O 错误结束请求
    pub fn with_io_buffer<F, R>(&self, id: BufferId, f: F) -> Option<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let (frame, range) = self.io_target(id)?;
        let bytes = frame.bytes();
        Some(f(&bytes[range]))
    }

    /// 驱动填充缓冲区内容（读请求时使用）
    pub fn with_io_buffer_mut<F, R>(&self, id: BufferId, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let (frame, range) = self.io_target(id)?;
        let mut bytes = frame.bytes();
        Some(f(&mut bytes[range]))
    }

    /// 正在传输的缓冲区所在的页和页内范围
    fn io_target(&self, id: BufferId) -> Option<(Arc<PageFrame>, Range<usize>)> {
        let st = self.lock_state();
        match st.heads.get(id) {
            Some(bh) if bh.is_bound() && bh.is_locked() => {
                Some((st.frame(id).clone(), bh.offset..bh.offset + bh.size.bytes()))
            }
            _ => {
                log::error!("[BUFFER] driver touched buffer {} outside of a request", id);
                None
            }
        }
    }
}
