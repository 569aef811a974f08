//! 缓存增长与回收
//!
//! - `grow_buffers`: 向页分配器要一页，切成同样大小的缓冲区放进空闲链表
//! - `refill_freelist`: 为某个大小等级补充空闲缓冲区
//! - `shrink_buffers`: 内存紧张时回收整页
//! - `maybe_shrink_lav_buffers`: 按负载均值在大小等级之间再平衡
//!
//! 页是回收的单位：只有一页上所有的兄弟缓冲区同时空闲（无引用、干净、未加锁）
//! 并且页没有被映射时，页才会还给页分配器。

use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use super::{BufferCache, CacheState};
use crate::consts::*;
use crate::page::{Gfp, PageFrame};
use crate::types::{BlockSize, BufferId, Disposition, RwMode};

/// 等待空闲缓冲区时每次睡眠的上限
const FREE_WAIT_SLICE: Duration = Duration::from_millis(10);

/// 某条处置链表上的回收候选游标
struct Candidates {
    list: Disposition,
    snapshot: Vec<BufferId>,
    cursor: usize,
    current: Option<BufferId>,
}

impl BufferCache {
    /// 新增一页缓冲区
    ///
    /// # 返回
    ///
    /// 页分配失败时返回 `false`
    pub(crate) fn grow_buffers(&self, st: &mut CacheState, gfp: Gfp, size: BlockSize) -> bool {
        let Some(page) = self.allocator.alloc_page(gfp) else {
            return false;
        };
        let frame = Arc::new(PageFrame::new(page));
        let n = size.per_page();
        let ids: Vec<BufferId> = (0..n).map(|_| st.alloc_head()).collect();
        let slot = st.install_page(frame, ids.clone());
        for (i, &id) in ids.iter().enumerate() {
            let bh = st.head_mut(id);
            bh.size = size;
            bh.page = slot;
            bh.offset = i * size.bytes();
            bh.dev = None;
        }
        // 新页的缓冲区放在空闲链表表头，保持页内顺序
        for &id in ids.iter().rev() {
            st.free[size.index()].push_front(id);
        }
        st.nr_buffers += n;
        st.nr_buffers_size[size.index()] += n;
        st.buffermem += PAGE_SIZE;
        self.buffer_wait.notify_all();
        log::debug!("[BUFFER] grew {} buffers of {} bytes (gfp={:?})", n, size.bytes(), gfp);
        true
    }

    /// 回收缓冲区所在的整页
    ///
    /// # 返回
    ///
    /// 页上有任何一个兄弟缓冲区不空闲、或者页被映射时返回 `false`
    pub(crate) fn try_to_free(&self, st: &mut CacheState, id: BufferId) -> bool {
        if !st.page_idle(id) {
            return false;
        }
        let slot = st.head(id).page;
        let siblings = st.siblings(id).to_vec();
        for &sib in &siblings {
            let isize = st.head(sib).size.index();
            st.nr_buffers -= 1;
            st.nr_buffers_size[isize] -= 1;
            st.remove_from_queues(sib);
            st.put_unused_head(sib);
        }
        let page = st.remove_page(slot);
        st.buffermem -= PAGE_SIZE;
        self.allocator.free_page(page.frame.take_page());
        log::debug!("[BUFFER] freed page {:#x} ({} buffers)", page.frame.pfn(), siblings.len());
        true
    }

    /// 为 `size` 补充空闲缓冲区
    ///
    /// 依次尝试：直接增长、跨大小等级再平衡、从处置链表选举最旧的干净缓冲区、
    /// 最后唤醒 bdflush 并等待。可能释放并重新获取结构锁。
    pub(crate) fn refill_freelist<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        size: BlockSize,
    ) -> MutexGuard<'a, CacheState> {
        if st.nr_free(size) > self.config.refill_threshold {
            return st;
        }
        let page = PAGE_SIZE as i64;
        let mut needed = i64::from(st.params.nrefill) * size.bytes() as i64;

        // 空闲页充足时直接增长
        let min_free = self.allocator.min_free_pages();
        while self.allocator.nr_free_pages() > min_free * 2
            && needed > 0
            && self.grow_buffers(&mut st, Gfp::Buffer, size)
        {
            needed -= page;
        }
        if needed <= 0 {
            return st;
        }

        // 其他大小等级占用过多时先裁剪它们
        loop {
            let (guard, shrunk) = self.maybe_shrink_lav_buffers(st, Some(size));
            st = guard;
            if !shrunk || !self.grow_buffers(&mut st, Gfp::Buffer, size) {
                break;
            }
            needed -= page;
            if needed <= 0 {
                return st;
            }
        }

        loop {
            let reclaimed = self.reclaim_lru_candidates(&mut st, size, needed);
            needed -= (reclaimed * size.bytes()) as i64;
            if needed <= 0 {
                return st;
            }

            if self.allocator.nr_free_pages() > CRITICAL_FREE_PAGES
                && self.grow_buffers(&mut st, Gfp::Buffer, size)
            {
                needed -= page;
                continue;
            }
            if !st.free[size.index()].is_empty() {
                return st;
            }

            if !self.grow_buffers(&mut st, Gfp::Atomic, size) {
                drop(st);
                self.wakeup_bdflush(true);
                st = self.lock_state();
                if st.free[size.index()].is_empty() {
                    let (guard, _) = self
                        .buffer_wait
                        .wait_timeout(st, FREE_WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner);
                    st = guard;
                }
            }
            needed -= page;
            if needed <= 0 {
                return st;
            }
        }
    }

    /// 从 DIRTY 和 SHARED 以外的处置链表中回收缓冲区
    ///
    /// 每条链表保留一个候选（最靠前的干净、无引用、未加锁、大小相同的缓冲区），
    /// 每次回收 `lru_time` 最早的候选，然后从该链表重新选出下一个候选。
    ///
    /// # 返回
    ///
    /// 回收的缓冲区数
    fn reclaim_lru_candidates(&self, st: &mut CacheState, size: BlockSize, needed: i64) -> usize {
        let now = self.now();
        let mut dirty_seen = 0u32;
        let mut lists: Vec<Candidates> = Disposition::ALL
            .into_iter()
            .filter(|&l| l != Disposition::Dirty && l != Disposition::Shared)
            .map(|list| Candidates {
                list,
                snapshot: st.lru[list.index()].snapshot(usize::MAX),
                cursor: 0,
                current: None,
            })
            .collect();
        for c in &mut lists {
            c.current = next_candidate(st, c, size, now, &mut dirty_seen);
        }

        let mut reclaimed = 0usize;
        while needed > (reclaimed * size.bytes()) as i64 {
            let best = lists
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.current.map(|id| (st.head(id).lru_time, i)))
                .min();
            let Some((_, i)) = best else {
                break;
            };
            let Some(id) = lists[i].current else {
                break;
            };
            st.remove_from_queues(id);
            st.put_last_free(id);
            reclaimed += 1;
            lists[i].current = next_candidate(st, &mut lists[i], size, now, &mut dirty_seen);
        }

        if dirty_seen > st.params.nref_dirt {
            st.wake_bdflush = true;
        }
        if reclaimed > 0 {
            log::trace!("[BUFFER] refill reclaimed {} buffers of {} bytes", reclaimed, size.bytes());
        }
        reclaimed
    }

    /// 若有大小等级相对其负载均值占用过多缓冲区，回收该等级的一页
    ///
    /// 只有一个大小等级有缓冲区时不做任何事。等级 n 占用过多的条件：
    /// `buffers_n * total_lav > lav_ratio * lav_n * total_buffers`（不计共享缓冲区）
    pub(crate) fn maybe_shrink_lav_buffers<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        size: Option<BlockSize>,
    ) -> (MutexGuard<'a, CacheState>, bool) {
        let shared = Disposition::Shared.index();
        let total_lav: u64 = st.buffers_lav.iter().sum();
        let total_n: usize = (0..NR_SIZES)
            .map(|n| st.nr_buffers_size[n] - st.nr_buffers_st[n][shared])
            .sum();
        let n_sizes = st.nr_buffers_size.iter().filter(|&&n| n > 0).count();
        if n_sizes <= 1 {
            return (st, false);
        }
        let ratio = u64::from(st.params.lav_ratio);
        for class in BlockSize::ALL {
            let n = class.index();
            if Some(class) == size || st.nr_buffers_size[n] == 0 {
                continue;
            }
            let owned = (st.nr_buffers_size[n] - st.nr_buffers_st[n][shared]) as u64;
            if owned * total_lav > ratio * st.buffers_lav[n] * total_n as u64 {
                log::debug!("[BUFFER] size {} over-represented, trimming", class.bytes());
                let (guard, freed) = self.shrink_specific_buffers(st, LAV_SHRINK_PRIORITY, Some(class));
                st = guard;
                if freed {
                    return (st, true);
                }
            }
        }
        (st, false)
    }

    /// 内存紧张时回收缓冲区
    ///
    /// `priority` 越小越紧急：0 先同步写出全部脏缓冲区并等待，1 只发出写请求，
    /// 2 唤醒 bdflush 并等待一轮结束。扫描深度为 `2 * count >> priority`。
    ///
    /// # 返回
    ///
    /// 是否还给页分配器至少一页
    pub fn shrink_buffers(&self, priority: u32) -> bool {
        if priority < 2 {
            if let Err(e) = self.sync_buffers(None, priority == 0) {
                log::warn!("[BUFFER] shrink_buffers: sync reported {}", e);
            }
        }
        if priority == 2 {
            self.wakeup_bdflush(true);
        }
        let st = self.lock_state();
        let (st, freed) = self.maybe_shrink_lav_buffers(st, None);
        if freed {
            self.release_state(st);
            return true;
        }
        let (st, freed) = self.shrink_specific_buffers(st, priority, None);
        self.release_state(st);
        freed
    }

    /// 回收指定大小等级（`None` 表示任意）的一页
    ///
    /// 先看空闲链表，再按处置链表扫描。扫描中遇到的脏缓冲区发出尽力写，
    /// `priority` 为 0 时会等待加锁的缓冲区。
    pub(crate) fn shrink_specific_buffers<'a>(
        &'a self,
        mut st: MutexGuard<'a, CacheState>,
        priority: u32,
        size: Option<BlockSize>,
    ) -> (MutexGuard<'a, CacheState>, bool) {
        let wanted = |s: BlockSize| size.map_or(true, |want| want == s);

        for class in BlockSize::ALL.into_iter().filter(|&s| wanted(s)) {
            let snapshot = st.free[class.index()].snapshot(usize::MAX);
            for id in snapshot {
                let bh = st.head(id);
                if !bh.is_free() || bh.size != class || bh.count > 0 {
                    continue;
                }
                if self.try_to_free(&mut st, id) {
                    return (st, true);
                }
            }
        }

        let now = self.now();
        for list in Disposition::ALL {
            if priority > 3 && list == Disposition::Shared {
                continue;
            }
            let depth = (2 * st.nr_buffers_type[list.index()]) >> priority;
            let snapshot = st.lru[list.index()].snapshot(depth);
            for id in snapshot {
                let bh = st.head(id);
                if !bh.is_bound() || bh.list != list {
                    continue;
                }
                if list == Disposition::Shared && !st.is_shared(id) {
                    st.refile(id, now);
                }
                let bh = st.head(id);
                if bh.count > 0 || !wanted(bh.size) {
                    continue;
                }
                if bh.is_locked() {
                    if priority > 0 {
                        continue;
                    }
                    st = self.wait_on_buffer(st, id);
                    let bh = st.head(id);
                    if !bh.is_bound() || bh.count > 0 {
                        continue;
                    }
                }
                if st.head(id).is_dirty() {
                    st.head_mut(id).get();
                    st.head_mut(id).flushtime = 0;
                    drop(st);
                    if let Err(e) = self.submit(RwMode::WriteAhead, &[id]) {
                        log::warn!("[BUFFER] write-ahead of buffer {} failed: {}", id, e);
                    }
                    st = self.lock_state();
                    self.unpin(&mut st, id);
                    continue;
                }
                if self.try_to_free(&mut st, id) {
                    return (st, true);
                }
            }
        }
        (st, false)
    }
}

/// 从游标位置开始寻找下一个可回收的候选
///
/// 脏的或共享的缓冲区顺手重新归档到正确的链表。LOCKED 链表上遇到加锁的缓冲区时
/// 认为剩下的也都在 I/O 中，停止这条链表。
fn next_candidate(
    st: &mut CacheState,
    c: &mut Candidates,
    size: BlockSize,
    now: u64,
    dirty_seen: &mut u32,
) -> Option<BufferId> {
    while c.cursor < c.snapshot.len() {
        let id = c.snapshot[c.cursor];
        c.cursor += 1;
        let bh = st.head(id);
        if !bh.is_bound() || bh.list != c.list {
            continue;
        }
        let (dirty, locked, count, bsize) = (bh.is_dirty(), bh.is_locked(), bh.count, bh.size);
        if dirty || st.is_shared(id) {
            if dirty {
                *dirty_seen += 1;
            }
            st.refile(id, now);
            continue;
        }
        if count > 0 || bsize != size {
            continue;
        }
        if locked {
            if matches!(c.list, Disposition::Locked | Disposition::LockedRecent) {
                return None;
            }
            continue;
        }
        return Some(id);
    }
    None
}
