//! 缓存结构状态
//!
//! 描述符池、页表、哈希索引、处置链表、空闲链表以及各种计数器都在
//! [`CacheState`] 中，由缓存的结构锁统一保护。这里的操作都不会阻塞，
//! 需要等待或发起 I/O 的操作在 `BufferCache` 上实现。

use std::collections::HashSet;
use std::sync::Arc;

use super::buffer::{BufferFlags, BufferHead};
use super::hash::HashIndex;
use super::lists::BufList;
use crate::bdflush::BdflushParams;
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::page::PageFrame;
use crate::types::{BlockSize, BufferId, DeviceId, Disposition};

/// 缓存持有的一个页，以及切分出的全部描述符（按页内偏移排列）
pub(crate) struct BufferPage {
    pub frame: Arc<PageFrame>,
    pub buffers: Vec<BufferId>,
}

pub(crate) struct CacheState {
    pub heads: Vec<BufferHead>,
    unused: Vec<BufferId>,
    pages: Vec<Option<BufferPage>>,
    free_page_slots: Vec<usize>,
    pub hash: HashIndex,
    pub lru: [BufList; NR_LIST],
    pub free: [BufList; NR_SIZES],

    pub nr_buffers: usize,
    pub nr_buffers_size: [usize; NR_SIZES],
    pub nr_buffers_type: [usize; NR_LIST],
    pub nr_buffers_st: [[usize; NR_LIST]; NR_SIZES],
    pub buffer_usage: [u64; NR_SIZES],
    pub buffers_lav: [u64; NR_SIZES],
    pub buffermem: usize,

    pub params: BdflushParams,
    /// 重新归档时脏缓冲区越过阈值，释放结构锁后需要唤醒 bdflush
    pub wake_bdflush: bool,

    pub hits: u64,
    pub misses: u64,
    /// 因刷新而提交的写请求数
    pub writebacks: u64,
}

impl CacheState {
    pub fn new(nr_hash: usize, params: BdflushParams) -> Self {
        Self {
            heads: Vec::new(),
            unused: Vec::new(),
            pages: Vec::new(),
            free_page_slots: Vec::new(),
            hash: HashIndex::new(nr_hash),
            lru: core::array::from_fn(|_| BufList::new()),
            free: core::array::from_fn(|_| BufList::new()),
            nr_buffers: 0,
            nr_buffers_size: [0; NR_SIZES],
            nr_buffers_type: [0; NR_LIST],
            nr_buffers_st: [[0; NR_LIST]; NR_SIZES],
            buffer_usage: [0; NR_SIZES],
            buffers_lav: [0; NR_SIZES],
            buffermem: 0,
            params,
            wake_bdflush: false,
            hits: 0,
            misses: 0,
            writebacks: 0,
        }
    }

    pub fn head(&self, id: BufferId) -> &BufferHead {
        &self.heads[id]
    }

    pub fn head_mut(&mut self, id: BufferId) -> &mut BufferHead {
        &mut self.heads[id]
    }

    pub fn nr_free(&self, size: BlockSize) -> usize {
        self.free[size.index()].len()
    }

    //=========================================================================
    // 描述符与页
    //=========================================================================

    /// 取一个未使用的描述符
    pub fn alloc_head(&mut self) -> BufferId {
        let id = match self.unused.pop() {
            Some(id) => id,
            None => {
                let id = self.heads.len();
                self.heads.push(BufferHead::new(id));
                id
            }
        };
        self.heads[id].in_use = true;
        id
    }

    /// 把描述符放回未使用池
    pub fn put_unused_head(&mut self, id: BufferId) {
        if !self.heads[id].in_use {
            log::error!("[BUFFER] buffer head {} freed twice", id);
            panic!("buffer head {} freed twice", id);
        }
        self.heads[id] = BufferHead::new(id);
        self.unused.push(id);
    }

    pub fn nr_buffer_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn nr_unused_heads(&self) -> usize {
        self.unused.len()
    }

    /// 登记一个新切分的页，返回页槽位
    pub fn install_page(&mut self, frame: Arc<PageFrame>, buffers: Vec<BufferId>) -> usize {
        let page = BufferPage { frame, buffers };
        match self.free_page_slots.pop() {
            Some(slot) => {
                self.pages[slot] = Some(page);
                slot
            }
            None => {
                self.pages.push(Some(page));
                self.pages.len() - 1
            }
        }
    }

    /// 注销页
    pub fn remove_page(&mut self, slot: usize) -> BufferPage {
        match self.pages.get_mut(slot).and_then(Option::take) {
            Some(page) => {
                self.free_page_slots.push(slot);
                page
            }
            None => {
                log::error!("[BUFFER] page slot {} is not in use", slot);
                panic!("page slot {} is not in use", slot);
            }
        }
    }

    pub fn page(&self, slot: usize) -> &BufferPage {
        match self.pages.get(slot).and_then(Option::as_ref) {
            Some(page) => page,
            None => panic!("page slot {} is not in use", slot),
        }
    }

    /// 描述符所在页的全部兄弟描述符
    pub fn siblings(&self, id: BufferId) -> &[BufferId] {
        &self.page(self.heads[id].page).buffers
    }

    pub fn frame(&self, id: BufferId) -> &Arc<PageFrame> {
        &self.page(self.heads[id].page).frame
    }

    /// 所在页是否被映射共享
    pub fn is_shared(&self, id: BufferId) -> bool {
        self.frame(id).mapped() > 0
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    //=========================================================================
    // 哈希
    //=========================================================================

    /// 在哈希索引中查找 (dev, block)
    ///
    /// # 返回
    ///
    /// 找到的缓冲区块大小与 `size` 不一致时返回 `Corrupted`
    pub fn find_buffer(&self, dev: DeviceId, block: u64, size: BlockSize) -> Result<Option<BufferId>> {
        let heads = &self.heads;
        let found = self.hash.find(dev, block, |id| heads[id].matches(dev, block));
        match found {
            Some(id) if heads[id].size != size => {
                log::error!(
                    "[BUFFER] block {} on {} cached as {} bytes, requested {} bytes",
                    block,
                    dev,
                    heads[id].size.bytes(),
                    size.bytes()
                );
                Err(Error::new(ErrorKind::Corrupted, "block cached with a different block size"))
            }
            other => Ok(other),
        }
    }

    /// 从哈希中摘除，保留在处置链表上
    pub fn remove_from_hash(&mut self, id: BufferId) {
        let bh = &self.heads[id];
        if let (true, Some(dev)) = (bh.hashed, bh.dev) {
            let block = bh.blocknr;
            if !self.hash.remove(dev, block, id) {
                log::error!("[BUFFER] hash chain corrupted for buffer {}", id);
                panic!("hash chain corrupted for buffer {}", id);
            }
            self.heads[id].hashed = false;
        }
    }

    //=========================================================================
    // 链表
    //=========================================================================

    fn remove_from_lru(&mut self, id: BufferId) {
        let bh = &self.heads[id];
        let (list, isize) = (bh.list.index(), bh.size.index());
        if !self.lru[list].remove(id) {
            log::error!("[BUFFER] LRU list {} corrupted at buffer {}", bh.list.name(), id);
            panic!("LRU list corrupted");
        }
        self.nr_buffers_type[list] -= 1;
        self.nr_buffers_st[isize][list] -= 1;
    }

    pub fn remove_from_free_list(&mut self, id: BufferId) {
        let isize = self.heads[id].size.index();
        if !self.free[isize].remove(id) {
            log::error!("[BUFFER] free list {} corrupted at buffer {}", isize, id);
            panic!("free list corrupted");
        }
    }

    /// 从哈希与所在链表中摘除
    pub fn remove_from_queues(&mut self, id: BufferId) {
        if self.heads[id].dev.is_none() {
            self.remove_from_free_list(id);
            return;
        }
        self.remove_from_hash(id);
        self.remove_from_lru(id);
    }

    /// 按当前身份插入：已绑定的进哈希和处置链表表尾，未绑定的进空闲链表
    pub fn insert_into_queues(&mut self, id: BufferId) {
        let bh = &self.heads[id];
        let Some(dev) = bh.dev else {
            self.put_last_free(id);
            return;
        };
        let (list, isize, block) = (bh.list.index(), bh.size.index(), bh.blocknr);
        self.lru[list].push_back(id);
        self.nr_buffers_type[list] += 1;
        self.nr_buffers_st[isize][list] += 1;
        self.hash.insert(dev, block, id);
        self.heads[id].hashed = true;
    }

    /// 放到空闲链表表尾
    pub fn put_last_free(&mut self, id: BufferId) {
        let bh = &mut self.heads[id];
        bh.dev = None;
        bh.hashed = false;
        let isize = bh.size.index();
        self.free[isize].push_back(id);
    }

    /// 移到所在处置链表表尾
    pub fn put_last_lru(&mut self, id: BufferId) {
        let bh = &self.heads[id];
        if bh.dev.is_some() {
            self.lru[bh.list.index()].move_to_back(id);
        }
    }

    fn move_to_list(&mut self, id: BufferId, dispose: Disposition) {
        self.remove_from_lru(id);
        let bh = &mut self.heads[id];
        bh.list = dispose;
        let isize = bh.size.index();
        self.lru[dispose.index()].push_back(id);
        self.nr_buffers_type[dispose.index()] += 1;
        self.nr_buffers_st[isize][dispose.index()] += 1;
    }

    /// 脏缓冲区数是否超过非共享缓冲区的 `nfract` 百分比
    pub fn too_many_dirty(&self) -> bool {
        let dirty = self.nr_buffers_type[Disposition::Dirty.index()];
        let shared = self.nr_buffers_type[Disposition::Shared.index()];
        dirty > self.nr_buffers.saturating_sub(shared) * self.params.nfract as usize / 100
    }

    /// 按当前标志把缓冲区重新归档到合适的处置链表
    ///
    /// 进入 DIRTY 后脏缓冲区越过阈值时设置 `wake_bdflush`
    pub fn refile(&mut self, id: BufferId, now: u64) {
        if self.heads[id].dev.is_none() {
            log::error!("[BUFFER] attempt to refile free buffer {}", id);
            panic!("attempt to refile free buffer");
        }
        let shared = self.is_shared(id);
        let age_super = u64::from(self.params.age_super);
        let bh = &mut self.heads[id];
        let mut dispose = if bh.is_dirty() {
            Disposition::Dirty
        } else if shared {
            Disposition::Shared
        } else if bh.is_locked() {
            Disposition::Locked
        } else if bh.list == Disposition::Shared {
            Disposition::Unshared
        } else {
            Disposition::Clean
        };
        if dispose == Disposition::Clean {
            bh.lru_time = now;
        }
        if dispose == bh.list {
            return;
        }
        if dispose == Disposition::Dirty || dispose == Disposition::Unshared {
            bh.lru_time = now;
        }
        if dispose == Disposition::Locked && bh.flushtime.wrapping_sub(bh.lru_time) <= age_super {
            dispose = Disposition::LockedRecent;
        }
        if dispose == bh.list {
            return;
        }
        self.move_to_list(id, dispose);
        if dispose == Disposition::Dirty && self.too_many_dirty() {
            self.wake_bdflush = true;
        }
    }

    /// 计算脏缓冲区的刷新期限，保留较早的那个；干净的缓冲区期限清零
    pub fn set_writetime(&mut self, id: BufferId, is_super: bool, now: u64) {
        let age = if is_super { self.params.age_super } else { self.params.age_buffer };
        let bh = &mut self.heads[id];
        if bh.is_dirty() {
            let newtime = now + u64::from(age);
            if bh.flushtime == 0 || bh.flushtime > newtime {
                bh.flushtime = newtime;
            }
        } else {
            bh.flushtime = 0;
        }
    }

    /// 清除脏标志并重新归档
    pub fn mark_clean(&mut self, id: BufferId, now: u64) {
        if self.heads[id].is_dirty() {
            self.heads[id].flags.remove(BufferFlags::DIRTY);
            if self.heads[id].dev.is_some() {
                self.refile(id, now);
            }
        }
    }

    /// 更新各大小等级的负载均值，并清零使用计数
    pub fn update_load_average(&mut self) {
        let lav_const = u64::from(self.params.lav_const);
        for isize in 0..NR_SIZES {
            let usage = core::mem::take(&mut self.buffer_usage[isize]);
            self.buffers_lav[isize] =
                (self.buffers_lav[isize] * lav_const + usage * (FIXED_1 - lav_const)) >> FSHIFT;
        }
    }

    /// 页上所有兄弟描述符是否都空闲（无引用、干净、未加锁），且页未被映射
    pub fn page_idle(&self, id: BufferId) -> bool {
        !self.is_shared(id)
            && self.siblings(id).iter().all(|&sib| {
                let bh = &self.heads[sib];
                bh.count == 0 && !bh.is_dirty() && !bh.is_locked()
            })
    }

    //=========================================================================
    // 一致性检查
    //=========================================================================

    /// 检查结构不变式，违反时 panic
    pub fn check_invariants(&self) {
        let mut identities = HashSet::new();
        let mut per_size = [0usize; NR_SIZES];
        for bh in self.heads.iter().filter(|bh| bh.in_use) {
            let isize = bh.size.index();
            per_size[isize] += 1;
            assert!(self.siblings(bh.id).contains(&bh.id), "buffer {} missing from its page", bh.id);
            match bh.dev {
                Some(dev) => {
                    assert!(self.lru[bh.list.index()].contains(bh.id), "bound buffer {} not on its list", bh.id);
                    assert!(!self.free[isize].contains(bh.id), "bound buffer {} on a free list", bh.id);
                    if bh.hashed {
                        assert!(
                            identities.insert((dev, bh.blocknr)),
                            "two buffers cached for block {} on {}",
                            bh.blocknr,
                            dev
                        );
                        assert_eq!(self.find_buffer(dev, bh.blocknr, bh.size), Ok(Some(bh.id)));
                    }
                }
                None => {
                    assert!(self.free[isize].contains(bh.id), "free buffer {} not on free list", bh.id);
                    assert_eq!(bh.count, 0, "free buffer {} is referenced", bh.id);
                }
            }
        }
        for isize in 0..NR_SIZES {
            let on_lists: usize = self.nr_buffers_st[isize].iter().sum();
            assert_eq!(self.nr_buffers_size[isize], per_size[isize]);
            assert_eq!(on_lists + self.free[isize].len(), self.nr_buffers_size[isize]);
        }
        for list in 0..NR_LIST {
            assert_eq!(self.lru[list].len(), self.nr_buffers_type[list]);
        }
        assert_eq!(self.nr_buffers, self.nr_buffers_size.iter().sum::<usize>());
        assert_eq!(self.hash.len(), identities.len());
    }
}
