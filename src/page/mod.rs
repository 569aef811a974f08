//! 物理页来源
//!
//! 缓冲区缓存从外部页分配器获取物理页，并把它切分为若干个同样大小的缓冲区。
//!
//! - [`PageAllocator`] - 页分配器 trait
//! - [`FixedPagePool`] - 固定页数的栈式分配器
//! - [`PageFrame`] - 缓存持有的页（字节 + 映射计数）

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::consts::PAGE_SIZE;

/// 分配标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gfp {
    /// 为缓冲区缓存增长分配，不得动用保留页
    Buffer,
    /// 原子分配，可以动用保留页
    Atomic,
    /// 内核初始化分配，可以动用保留页
    Kernel,
}

/// 一个物理页
///
/// 页分配器与缓存之间传递的所有权单位
#[derive(Debug)]
pub struct Page {
    pfn: usize,
    data: Box<[u8]>,
}

impl Page {
    /// 页帧号
    pub fn pfn(&self) -> usize {
        self.pfn
    }

    /// 页内容
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// 页分配器 trait
pub trait PageAllocator: Send + Sync {
    /// 分配一个页
    ///
    /// # 返回
    ///
    /// 分配失败返回 `None`
    fn alloc_page(&self, gfp: Gfp) -> Option<Page>;

    /// 归还一个页
    fn free_page(&self, page: Page);

    /// 当前空闲页数
    fn nr_free_pages(&self) -> usize;

    /// 保留页数（`Gfp::Buffer` 不会动用）
    fn min_free_pages(&self) -> usize;

    /// 总页数
    fn total_pages(&self) -> usize;
}

//=============================================================================
// 固定大小的页池
//=============================================================================

#[derive(Debug)]
struct PoolInner {
    /// 尚未使用过的第一个页帧号
    current: usize,
    /// 归还后可以复用的页帧号
    recycled: Vec<usize>,
    allocs: u64,
    frees: u64,
}

/// 固定页数的栈式页分配器
///
/// 先复用归还的页，再从未使用过的区间取新页。
#[derive(Debug)]
pub struct FixedPagePool {
    total: usize,
    min_free: usize,
    inner: Mutex<PoolInner>,
}

impl FixedPagePool {
    /// 创建页池
    ///
    /// # 参数
    ///
    /// * `total` - 总页数
    /// * `min_free` - 保留页数
    pub fn new(total: usize, min_free: usize) -> Self {
        Self {
            total,
            min_free,
            inner: Mutex::new(PoolInner {
                current: 0,
                recycled: Vec::new(),
                allocs: 0,
                frees: 0,
            }),
        }
    }

    /// 按内存字节数创建页池，保留 1/64 的页
    pub fn with_memory(bytes: usize) -> Self {
        let total = bytes / PAGE_SIZE;
        Self::new(total, (total / 64).max(1))
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free_count(&self, inner: &PoolInner) -> usize {
        self.total - inner.current + inner.recycled.len()
    }

    /// 累计分配次数
    pub fn alloc_count(&self) -> u64 {
        self.lock().allocs
    }

    /// 累计归还次数
    pub fn free_page_count(&self) -> u64 {
        self.lock().frees
    }
}

impl PageAllocator for FixedPagePool {
    fn alloc_page(&self, gfp: Gfp) -> Option<Page> {
        let mut inner = self.lock();
        let free = self.free_count(&inner);
        let reserve = match gfp {
            Gfp::Buffer => self.min_free,
            Gfp::Atomic | Gfp::Kernel => 0,
        };
        if free <= reserve {
            log::trace!("[PAGE] alloc refused: free={} gfp={:?}", free, gfp);
            return None;
        }
        let pfn = match inner.recycled.pop() {
            Some(pfn) => pfn,
            None => {
                inner.current += 1;
                inner.current - 1
            }
        };
        inner.allocs += 1;
        Some(Page {
            pfn,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        })
    }

    fn free_page(&self, page: Page) {
        let mut inner = self.lock();
        if page.pfn >= inner.current || inner.recycled.contains(&page.pfn) {
            log::error!("[PAGE] freeing page {:#x} that is not allocated", page.pfn);
            panic!("page {:#x} has not been allocated", page.pfn);
        }
        inner.recycled.push(page.pfn);
        inner.frees += 1;
    }

    fn nr_free_pages(&self) -> usize {
        let inner = self.lock();
        self.free_count(&inner)
    }

    fn min_free_pages(&self) -> usize {
        self.min_free
    }

    fn total_pages(&self) -> usize {
        self.total
    }
}

//=============================================================================
// 缓存持有的页
//=============================================================================

/// 缓冲区缓存持有的一个页
///
/// `mapped` 记录页被 [`SharedPage`](crate::cache::SharedPage) 映射的次数，
/// 非零时页上的缓冲区处于共享状态，页不可回收。
#[derive(Debug)]
pub struct PageFrame {
    pfn: usize,
    bytes: Mutex<Box<[u8]>>,
    mapped: AtomicUsize,
}

impl PageFrame {
    pub(crate) fn new(page: Page) -> Self {
        Self {
            pfn: page.pfn,
            bytes: Mutex::new(page.data),
            mapped: AtomicUsize::new(0),
        }
    }

    /// 页帧号
    pub fn pfn(&self) -> usize {
        self.pfn
    }

    /// 锁定页内容
    pub(crate) fn bytes(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前映射次数
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    pub(crate) fn map(&self) {
        self.mapped.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unmap(&self) {
        self.mapped.fetch_sub(1, Ordering::AcqRel);
    }

    /// 取出页内容，交还给分配器
    pub(crate) fn take_page(&self) -> Page {
        let data = core::mem::take(&mut *self.bytes());
        Page { pfn: self.pfn, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserve() {
        let pool = FixedPagePool::new(3, 1);
        let a = pool.alloc_page(Gfp::Buffer).unwrap();
        let b = pool.alloc_page(Gfp::Buffer).unwrap();
        assert_eq!(pool.nr_free_pages(), 1);
        // 只剩保留页
        assert!(pool.alloc_page(Gfp::Buffer).is_none());
        let c = pool.alloc_page(Gfp::Atomic).unwrap();
        assert!(pool.alloc_page(Gfp::Atomic).is_none());

        pool.free_page(b);
        assert_eq!(pool.nr_free_pages(), 1);
        pool.free_page(a);
        pool.free_page(c);
        assert_eq!(pool.nr_free_pages(), 3);
        assert_eq!(pool.alloc_count(), 3);
        assert_eq!(pool.free_page_count(), 3);
    }

    #[test]
    fn test_pool_recycles_first() {
        let pool = FixedPagePool::new(4, 0);
        let a = pool.alloc_page(Gfp::Kernel).unwrap();
        let pfn = a.pfn();
        pool.free_page(a);
        let b = pool.alloc_page(Gfp::Kernel).unwrap();
        assert_eq!(b.pfn(), pfn);
        assert_eq!(b.data().len(), PAGE_SIZE);
    }

    #[test]
    #[should_panic]
    fn test_pool_double_free() {
        let pool = FixedPagePool::new(2, 0);
        let a = pool.alloc_page(Gfp::Kernel).unwrap();
        let pfn = a.pfn();
        pool.free_page(a);
        pool.free_page(Page { pfn, data: Box::new([]) });
    }

    #[test]
    fn test_page_frame_mapping() {
        let pool = FixedPagePool::new(1, 0);
        let frame = PageFrame::new(pool.alloc_page(Gfp::Kernel).unwrap());
        frame.bytes()[0] = 7;
        frame.map();
        assert_eq!(frame.mapped(), 1);
        frame.unmap();
        let page = frame.take_page();
        assert_eq!(page.data()[0], 7);
        pool.free_page(page);
    }
}
