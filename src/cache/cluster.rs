//! 簇与页共享
//!
//! 簇：逻辑上相邻的一页块放在同一个物理页里。`generate_cluster` 为一串连续的块
//! 准备这样的页（新分配一页，或者把空闲链表上整页空闲的页重新绑定）。
//!
//! `bread_page` 读取一页的块。块正好按页内偏移排列在同一个缓存页里时，
//! 可以直接把缓存页共享出去（[`SharedPage`]），不必复制。

use std::sync::{Arc, MutexGuard};

use super::access::block_size;
use super::{BufferCache, BufferHandle, CacheState};
use crate::consts::PAGE_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::page::{Gfp, PageFrame};
use crate::types::{BlockSize, BufferId, DeviceId, RwMode};

/// 被共享出去的缓存页
///
/// 持有期间页上的缓冲区处于共享状态，页不会被回收。drop 时取消映射，
/// 缓冲区在下一次重新归档时回到 UNSHARED 链表。
#[derive(Debug)]
pub struct SharedPage {
    frame: Arc<PageFrame>,
}

impl SharedPage {
    fn new(frame: Arc<PageFrame>) -> Self {
        frame.map();
        Self { frame }
    }

    /// 页帧号
    pub fn pfn(&self) -> usize {
        self.frame.pfn()
    }

    /// 读取页内容
    pub fn with_bytes<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame.bytes())
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        self.frame.unmap();
    }
}

/// `bread_page` 的结果
#[derive(Debug)]
pub enum PageData {
    /// 直接共享的缓存页
    Shared(SharedPage),
    /// 复制出来的一页数据（空洞和读失败的块为 0）
    Copied(Box<[u8]>),
}

impl PageData {
    /// 是否共享了缓存页
    pub fn is_shared(&self) -> bool {
        matches!(self, PageData::Shared(_))
    }

    /// 读取页内容
    pub fn with_bytes<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        match self {
            PageData::Shared(page) => page.with_bytes(f),
            PageData::Copied(bytes) => f(bytes),
        }
    }
}

impl BufferCache {
    /// 为一页连续的块准备簇
    ///
    /// # 参数
    ///
    /// * `blocks` - 至少一页的块号，只看前 `PAGE_SIZE / size` 个
    ///
    /// # 返回
    ///
    /// - `Ok(true)` - 这些块已经绑定到同一页（尚未读入数据）
    /// - `Ok(false)` - 块不连续、已有块在缓存中，或者没有可用的页
    pub fn generate_cluster(&self, dev: DeviceId, blocks: &[u64], size: usize) -> Result<bool> {
        let size = block_size(size)?;
        let n = size.per_page();
        if blocks.len() < n {
            return Err(Error::new(ErrorKind::InvalidInput, "cluster needs a full page of blocks"));
        }
        let run = &blocks[..n];
        if run.windows(2).any(|w| w[0].checked_add(1) != Some(w[1])) {
            return Ok(false);
        }
        let st = self.lock_state();
        for &block in run {
            if st.find_buffer(dev, block, size)?.is_some() {
                self.release_state(st);
                return Ok(false);
            }
        }

        let (mut st, shrunk) = self.maybe_shrink_lav_buffers(st, Some(size));
        if shrunk && self.try_to_generate_cluster(&mut st, dev, run, size) {
            self.release_state(st);
            return Ok(true);
        }
        let done = if self.allocator.nr_free_pages() > self.allocator.min_free_pages() * 2 {
            self.try_to_generate_cluster(&mut st, dev, run, size)
        } else {
            let (guard, done) = self.reassign_cluster(st, dev, run, size);
            st = guard;
            done
        };
        self.release_state(st);
        Ok(done)
    }

    /// 分配新页，把全部缓冲区绑定到 `blocks` 后释放引用
    fn try_to_generate_cluster(&self, st: &mut CacheState, dev: DeviceId, blocks: &[u64], size: BlockSize) -> bool {
        if blocks.iter().any(|&block| !matches!(st.find_buffer(dev, block, size), Ok(None))) {
            return false;
        }
        let Some(ids) = self.install_bound_page(st, dev, blocks, size) else {
            return false;
        };
        for id in ids {
            self.unpin(st, id);
        }
        log::debug!("[BUFFER] generated cluster at block {} of {}", blocks[0], dev);
        true
    }

    /// 分配一页并按页内顺序绑定到 `blocks`，每个缓冲区持有一个引用
    ///
    /// 调用者保证这些块都不在缓存中
    fn install_bound_page(
        &self,
        st: &mut CacheState,
        dev: DeviceId,
        blocks: &[u64],
        size: BlockSize,
    ) -> Option<Vec<BufferId>> {
        let page = self.allocator.alloc_page(Gfp::Buffer)?;
        let frame = Arc::new(PageFrame::new(page));
        let ids: Vec<BufferId> = blocks.iter().map(|_| st.alloc_head()).collect();
        let slot = st.install_page(frame, ids.clone());
        let now = self.now();
        for (i, (&id, &block)) in ids.iter().zip(blocks).enumerate() {
            let bh = st.head_mut(id);
            bh.size = size;
            bh.page = slot;
            bh.offset = i * size.bytes();
            bh.bind(dev, block);
            bh.lru_time = now;
            st.insert_into_queues(id);
        }
        st.nr_buffers += ids.len();
        st.nr_buffers_size[size.index()] += ids.len();
        st.buffermem += PAGE_SIZE;
        Some(ids)
    }

    /// 把空闲链表上一个整页空闲的页重新绑定到 `blocks`
    ///
    /// 先把空闲链表补充到 `cluster_free_target`，再扫描空闲链表的前
    /// `clu_nfract` 百分比。
    fn reassign_cluster<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        dev: DeviceId,
        blocks: &[u64],
        size: BlockSize,
    ) -> (MutexGuard<'a, CacheState>, bool) {
        while st.nr_free(size) < self.config.cluster_free_target {
            let before = st.nr_free(size);
            st = self.refill_freelist(st, size);
            if st.nr_free(size) <= before {
                break;
            }
        }
        let limit = (st.nr_buffers * st.params.clu_nfract as usize / 100).max(size.per_page());
        let snapshot = st.free[size.index()].snapshot(limit);
        for id in snapshot {
            if !st.head(id).is_free() {
                continue;
            }
            if self.try_to_reassign(&mut st, id, dev, blocks, size) {
                log::debug!("[BUFFER] reassigned page to cluster at block {} of {}", blocks[0], dev);
                return (st, true);
            }
        }
        (st, false)
    }

    fn try_to_reassign(
        &self,
        st: &mut CacheState,
        id: BufferId,
        dev: DeviceId,
        blocks: &[u64],
        size: BlockSize,
    ) -> bool {
        if !st.page_idle(id) {
            return false;
        }
        let siblings = st.siblings(id).to_vec();
        if siblings.len() != blocks.len() || siblings.iter().any(|&sib| st.head(sib).size != size) {
            return false;
        }
        // 释放过锁之后别人可能已经建立了其中的块
        for &block in blocks {
            if !matches!(st.find_buffer(dev, block, size), Ok(None)) {
                return false;
            }
        }
        let now = self.now();
        for (&sib, &block) in siblings.iter().zip(blocks) {
            st.remove_from_queues(sib);
            let bh = st.head_mut(sib);
            bh.bind(dev, block);
            bh.count = 0;
            bh.lru_time = now;
            st.insert_into_queues(sib);
        }
        true
    }

    /// 读取一页的块
    ///
    /// # 参数
    ///
    /// * `blocks` - 至少一页的块号，`None` 表示空洞（读出为 0）
    /// * `share` - 是否尝试直接共享缓存页
    ///
    /// # 返回
    ///
    /// 共享成功时返回 [`PageData::Shared`]，否则返回复制出来的数据
    pub fn bread_page(
        &self,
        dev: DeviceId,
        blocks: &[Option<u64>],
        size: usize,
        share: bool,
    ) -> Result<PageData> {
        let bsize = block_size(size)?;
        let n = bsize.per_page();
        if blocks.len() < n {
            return Err(Error::new(ErrorKind::InvalidInput, "bread_page needs a full page of blocks"));
        }
        let blocks = &blocks[..n];
        if share {
            if let Some(page) = self.try_to_share_buffers(dev, blocks, bsize)? {
                return Ok(PageData::Shared(page));
            }
        }

        let mut out = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let mut handles: Vec<(usize, BufferHandle<'_>)> = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            if let Some(block) = *block {
                handles.push((i, self.getblk(dev, block, size)?));
            }
        }
        let to_read: Vec<&BufferHandle<'_>> =
            handles.iter().map(|(_, bh)| bh).filter(|bh| !bh.is_uptodate()).collect();
        if !to_read.is_empty() {
            self.ll_rw_block(RwMode::Read, &to_read)?;
        }
        for (i, bh) in &handles {
            bh.wait();
            if bh.is_uptodate() {
                let range = i * size..(i + 1) * size;
                bh.with_data(|data| out[range].copy_from_slice(data));
            } else {
                log::warn!("[BUFFER] bread_page: block {} of {} unreadable", bh.blocknr(), dev);
            }
        }
        Ok(PageData::Copied(out))
    }

    /// 尝试把块所在的缓存页直接共享出去
    fn try_to_share_buffers(
        &self,
        dev: DeviceId,
        blocks: &[Option<u64>],
        size: BlockSize,
    ) -> Result<Option<SharedPage>> {
        let Some(first) = blocks[0] else {
            return Ok(None);
        };
        let mut st = self.lock_state();
        let ids = match st.find_buffer(dev, first, size)? {
            Some(id) => check_aligned(&mut st, id, dev, blocks, size)?,
            None => self.try_to_load_aligned(&mut st, dev, blocks, size)?,
        };
        self.release_state(st);
        let Some(ids) = ids else {
            return Ok(None);
        };

        let handles: Vec<BufferHandle<'_>> = ids.into_iter().map(|id| BufferHandle::new(self, id)).collect();
        let to_read: Vec<&BufferHandle<'_>> = handles.iter().filter(|bh| !bh.is_uptodate()).collect();
        if !to_read.is_empty() {
            self.ll_rw_block(RwMode::Read, &to_read)?;
        }
        for bh in &handles {
            bh.wait();
        }
        if !handles.iter().all(|bh| bh.is_uptodate()) {
            return Ok(None);
        }
        let Some(frame) = handles.first().map(|bh| self.lock_state().frame(bh.id()).clone()) else {
            return Ok(None);
        };
        // 先映射再释放引用，brelse 会把缓冲区归档到 SHARED
        let page = SharedPage::new(frame);
        drop(handles);
        log::trace!("[BUFFER] sharing page {:#x} for block {} of {}", page.pfn(), first, dev);
        Ok(Some(page))
    }

    /// 块都不在缓存中时，新分配一页按页内顺序装入它们
    fn try_to_load_aligned(
        &self,
        st: &mut CacheState,
        dev: DeviceId,
        blocks: &[Option<u64>],
        size: BlockSize,
    ) -> Result<Option<Vec<BufferId>>> {
        let mut run = Vec::with_capacity(blocks.len());
        for block in blocks {
            let Some(block) = *block else {
                return Ok(None);
            };
            if st.find_buffer(dev, block, size)?.is_some() {
                return Ok(None);
            }
            run.push(block);
        }
        Ok(self.install_bound_page(st, dev, &run, size))
    }
}

/// 第一个块已经在缓存中：检查全部块是否按页内顺序排在同一页上，是则各取一个引用
fn check_aligned(
    st: &mut CacheState,
    first: BufferId,
    dev: DeviceId,
    blocks: &[Option<u64>],
    size: BlockSize,
) -> Result<Option<Vec<BufferId>>> {
    if st.head(first).offset != 0 {
        return Ok(None);
    }
    let siblings = st.siblings(first).to_vec();
    if siblings.len() != blocks.len() {
        return Ok(None);
    }
    for (&sib, block) in siblings.iter().zip(blocks) {
        let Some(block) = *block else {
            return Ok(None);
        };
        if st.find_buffer(dev, block, size)? != Some(sib) {
            return Ok(None);
        }
    }
    for &sib in &siblings {
        st.head_mut(sib).get();
    }
    Ok(Some(siblings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{fixture, ramdisk_cache};
    use crate::types::Disposition;

    #[test]
    fn test_generate_cluster() {
        let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
        assert!(cache.generate_cluster(dev, &[10, 11], 1024).is_err());
        // 不连续
        assert!(!cache.generate_cluster(dev, &[10, 11, 13, 14], 1024).unwrap());
        assert!(cache.generate_cluster(dev, &[10, 11, 12, 13], 1024).unwrap());
        // 已经在缓存中
        assert!(!cache.generate_cluster(dev, &[12, 13, 14, 15], 1024).unwrap());

        let st = cache.lock_state();
        let first = st.find_buffer(dev, 10, BlockSize::B1024).unwrap().unwrap();
        let page = st.head(first).page;
        for (i, block) in (10..14).enumerate() {
            let id = st.find_buffer(dev, block, BlockSize::B1024).unwrap().unwrap();
            assert_eq!(st.head(id).page, page);
            assert_eq!(st.head(id).offset, i * 1024);
            assert_eq!(st.head(id).count, 0);
        }
        drop(st);
        cache.check_consistency();
    }

    #[test]
    fn test_reassign_cluster_when_memory_is_tight() {
        // 4 页，保留 2 页：只能重用空闲链表上的页
        let (cache, _disk, dev) = ramdisk_cache(fixture::pool_with_reserve(4, 2));
        assert!(cache.generate_cluster(dev, &[40, 41, 42, 43], 1024).unwrap());
        cache.check_consistency();
        let bh = cache.get_hash_table(dev, 42, 1024).unwrap().unwrap();
        assert!(!bh.is_uptodate());
    }

    #[test]
    fn test_bread_page_copy_with_hole() {
        let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
        disk.write_sectors(dev, 4, &[0xaa; 1024]);
        disk.write_sectors(dev, 6, &[0xbb; 1024]);
        let data = cache.bread_page(dev, &[Some(2), None, Some(3), Some(9)], 1024, false).unwrap();
        assert!(!data.is_shared());
        data.with_bytes(|bytes| {
            assert!(bytes[..1024].iter().all(|&b| b == 0xaa));
            assert!(bytes[1024..2048].iter().all(|&b| b == 0));
            assert!(bytes[2048..3072].iter().all(|&b| b == 0xbb));
        });
    }

    #[test]
    fn test_bread_page_shares_aligned_page() {
        let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
        disk.write_sectors(dev, 40, &[0x11; 4096]);
        let blocks = [Some(20), Some(21), Some(22), Some(23)];

        let data = cache.bread_page(dev, &blocks, 1024, true).unwrap();
        assert!(data.is_shared());
        data.with_bytes(|bytes| assert!(bytes.iter().all(|&b| b == 0x11)));

        // 共享期间缓冲区在 SHARED 链表上，页不可回收
        let stats = cache.stats();
        assert_eq!(stats.lists[Disposition::Shared.index()].found, 4);
        cache.shrink_buffers(0);
        assert!(cache.get_hash_table(dev, 20, 1024).unwrap().is_some());

        // 同一页再次共享
        let again = cache.bread_page(dev, &blocks, 1024, true).unwrap();
        assert!(again.is_shared());
        drop(again);
        drop(data);

        // 不再映射后，下一次归档回到 UNSHARED
        drop(cache.getblk(dev, 20, 1024).unwrap());
        let st = cache.lock_state();
        let id = st.find_buffer(dev, 20, BlockSize::B1024).unwrap().unwrap();
        assert_eq!(st.head(id).list, Disposition::Unshared);
    }

    #[test]
    fn test_bread_page_misaligned_falls_back_to_copy() {
        let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
        drop(cache.bread(dev, 31, 1024).unwrap());
        let data = cache.bread_page(dev, &[Some(30), Some(31), Some(32), Some(33)], 1024, true).unwrap();
        assert!(!data.is_shared());
    }
}
