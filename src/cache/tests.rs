//! 缓冲区缓存的场景测试
//!
//! 也提供其他模块测试共用的夹具。

use std::sync::Arc;

use super::*;
use crate::bdflush::Param;
use crate::block::{Completion, RamDisk};
use crate::clock::ManualClock;
use crate::consts::PAGE_SIZE;
use crate::types::{Command, DeviceId, Disposition, RwMode};

/// 测试用的主设备号
pub(crate) const MAJOR: u8 = 3;

/// 每个内存盘的扇区数（4 MiB）
const DISK_SECTORS: u64 = 8192;

pub(crate) mod fixture {
    use std::sync::Arc;

    use crate::page::FixedPagePool;

    /// 保留 2 页的页池
    pub fn pool(pages: usize) -> Arc<FixedPagePool> {
        Arc::new(FixedPagePool::new(pages, 2))
    }

    pub fn pool_with_reserve(pages: usize, min_free: usize) -> Arc<FixedPagePool> {
        Arc::new(FixedPagePool::new(pages, min_free))
    }
}

/// 默认配置的缓存加一个同步完成的内存盘
pub(crate) fn ramdisk_cache(pool: Arc<crate::page::FixedPagePool>) -> (Arc<BufferCache>, Arc<RamDisk>, DeviceId) {
    let (cache, disk, dev, _clock) =
        build(pool, RamDisk::new(DISK_SECTORS), CacheConfig::default());
    (cache, disk, dev)
}

fn build(
    pool: Arc<crate::page::FixedPagePool>,
    disk: RamDisk,
    config: CacheConfig,
) -> (Arc<BufferCache>, Arc<RamDisk>, DeviceId, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1));
    let cache = Arc::new(BufferCache::new(pool, clock.clone(), config).unwrap());
    let disk = Arc::new(disk);
    cache.register_driver(MAJOR, disk.clone());
    (cache, disk, DeviceId::new(MAJOR, 0), clock)
}

//=============================================================================
// 基本读写
//=============================================================================

#[test]
fn test_write_then_read_hits_cache() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    {
        let bh = cache.getblk(dev, 10, 1024).unwrap();
        assert_eq!(bh.count(), 1);
        bh.with_data_mut(|data| data[..4].copy_from_slice(b"abcd"));
        bh.mark_uptodate();
    }

    let bh = cache.bread(dev, 10, 1024).unwrap().unwrap();
    bh.with_data(|data| assert_eq!(&data[..4], b"abcd"));
    assert!(bh.is_dirty());
    assert_eq!(disk.reads(), 0);
    assert_eq!(disk.requests(), 0);
    cache.check_consistency();
}

#[test]
fn test_bread_fetches_from_device() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    disk.write_sectors(dev, 14, &[0x5a; 1024]);

    let bh = cache.bread(dev, 7, 1024).unwrap().unwrap();
    assert!(bh.is_uptodate());
    assert!(!bh.is_dirty());
    bh.with_data(|data| assert!(data.iter().all(|&b| b == 0x5a)));
    assert_eq!(disk.reads(), 2);
    drop(bh);

    // 第二次命中
    drop(cache.bread(dev, 7, 1024).unwrap().unwrap());
    assert_eq!(disk.requests(), 1);
}

#[test]
fn test_size_mismatch_is_corruption() {
    let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
    let _bh = cache.getblk(dev, 10, 1024).unwrap();
    let err = cache.getblk(dev, 10, 512).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Corrupted);
    assert_eq!(cache.getblk(dev, 10, 3000).err().unwrap().kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_same_block_same_buffer() {
    let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
    let a = cache.getblk(dev, 33, 1024).unwrap();
    let b = cache.getblk(dev, 33, 1024).unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(a.count(), 2);
    drop(b);
    assert_eq!(a.count(), 1);
    // 不同次设备是不同的块
    let other = cache.getblk(DeviceId::new(MAJOR, 1), 33, 1024).unwrap();
    assert_ne!(other.id(), a.id());
}

#[test]
fn test_release_restores_free_counts() {
    let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
    for block in 0..3 {
        drop(cache.bread(dev, block, 1024).unwrap().unwrap());
    }
    let held = cache.getblk(dev, 0, 1024).unwrap();
    let id = held.id();
    drop(held);

    let before = cache.stats();
    // 对已经释放的缓冲区再释放一次只记录日志
    cache.brelse_id(id);
    cache.put_nowait(id);
    let after = cache.stats();
    assert_eq!(before.lists, after.lists);
    assert_eq!(before.sizes, after.sizes);
    assert!(after.lists.iter().all(|l| l.used == 0));
    cache.check_consistency();
}

//=============================================================================
// 内存压力
//=============================================================================

#[test]
fn test_refill_under_memory_pressure() {
    // 两页，保留一页：只能复用最旧的干净缓冲区
    let pool = fixture::pool_with_reserve(2, 1);
    let (cache, _disk, dev) = ramdisk_cache(pool.clone());
    for block in 0..4 {
        drop(cache.getblk(dev, block, 1024).unwrap());
    }
    let bh = cache.getblk(dev, 100, 1024).unwrap();
    assert_eq!(bh.blocknr(), 100);
    assert_eq!(pool.alloc_count(), 1);
    assert!(cache.get_hash_table(dev, 0, 1024).unwrap().is_none());
    assert_eq!(cache.stats().nr_buffers, 4);
    drop(bh);
    cache.check_consistency();
}

#[test]
fn test_grow_when_memory_is_plentiful() {
    let pool = fixture::pool(64);
    let (cache, _disk, dev) = ramdisk_cache(pool.clone());
    let held: Vec<_> = (0..4).map(|b| cache.getblk(dev, b, 1024).unwrap()).collect();
    let bh = cache.getblk(dev, 4, 1024).unwrap();
    assert!(pool.alloc_count() > 1);
    assert!(cache.stats().nr_buffers > 5);
    drop(bh);
    drop(held);
    cache.check_consistency();
}

#[test]
fn test_pinned_sibling_keeps_page() {
    let pool = fixture::pool(64);
    let (cache, _disk, dev) = ramdisk_cache(pool.clone());
    let held = cache.getblk(dev, 2, 1024).unwrap();
    for block in [0, 1, 3] {
        drop(cache.getblk(dev, block, 1024).unwrap());
    }

    assert!(!cache.shrink_buffers(0));
    assert_eq!(pool.free_page_count(), 0);
    assert!(cache.get_hash_table(dev, 0, 1024).unwrap().is_some());

    drop(held);
    assert!(cache.shrink_buffers(0));
    assert_eq!(pool.free_page_count(), 1);
    assert!(cache.get_hash_table(dev, 2, 1024).unwrap().is_none());
    assert_eq!(cache.stats().nr_buffers, 0);
    cache.check_consistency();
}

#[test]
fn test_lav_rebalance_trims_over_represented_size() {
    let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
    drop(cache.getblk(dev, 1, 512).unwrap());
    let small_before = cache.stats().sizes[BlockSize::B512.index()].buffers;
    assert!(small_before > 0);

    let mut st = cache.lock_state();
    st.buffers_lav[BlockSize::B1024.index()] = 10 * crate::consts::FIXED_1;
    st.buffers_lav[BlockSize::B512.index()] = 1;
    let (st, shrunk) = cache.maybe_shrink_lav_buffers(st, Some(BlockSize::B1024));
    drop(st);
    assert!(shrunk);

    let small_after = cache.stats().sizes[BlockSize::B512.index()].buffers;
    assert_eq!(small_before - small_after, BlockSize::B512.per_page());
    cache.check_consistency();
}

#[test]
fn test_shrink_priority_controls_writeback() {
    let config = CacheConfig { refill_threshold: 0, ..CacheConfig::default() };
    let (cache, disk, dev, _clock) =
        build(fixture::pool(64), RamDisk::with_mode(DISK_SECTORS, Completion::Deferred), config);
    cache.set_block_size(dev, 4096).unwrap();
    cache.set_bdflush_param(Param::Nfract, 100).unwrap();
    let cached = |block: u64| cache.lock_state().find_buffer(dev, block, BlockSize::B4096).unwrap().is_some();

    // 优先级 1：发出写请求但不等待
    {
        let bh = cache.getblk(dev, 0, 4096).unwrap();
        bh.mark_uptodate();
        bh.with_data_mut(|data| data.fill(0x11));
    }
    cache.shrink_buffers(1);
    let queued = cache.queued_requests(MAJOR);
    assert_eq!(queued.len(), 1);
    assert_eq!((queued[0].cmd, queued[0].sector, queued[0].nr_sectors), (Command::Write, 0, 8));
    assert_eq!(disk.writes(), 0);
    assert_eq!(disk.run_queue(&cache, MAJOR), 1);
    assert_eq!(disk.writes(), 8);

    // 优先级 3：只回收干净的页，扫到的脏缓冲区最多发出预写
    for block in 10..18 {
        let bh = cache.getblk(dev, block, 4096).unwrap();
        bh.mark_uptodate();
    }
    for block in 20..28 {
        let bh = cache.getblk(dev, block, 4096).unwrap();
        bh.mark_uptodate();
        bh.with_data_mut(|data| data.fill(block as u8));
    }
    while cache.shrink_buffers(3) {}

    assert!((20..28).all(cached));
    assert!((10..18).any(|block| !cached(block)));
    assert!(cache.queued_requests(MAJOR).len() < 8);
    assert!(cache.stats().dirty() > 0);

    disk.run_queue(&cache, MAJOR);
    cache.check_consistency();
}

//=============================================================================
// 写回
//=============================================================================

#[test]
fn test_deadline_flush() {
    let (cache, disk, dev, clock) =
        build(fixture::pool(64), RamDisk::new(DISK_SECTORS), CacheConfig::default());
    {
        let bh = cache.getblk(dev, 8, 1024).unwrap();
        bh.with_data_mut(|data| data.fill(0x77));
        bh.mark_uptodate();
    }
    let age = u64::from(cache.bdflush_params().age_buffer);

    clock.advance(age - 1);
    assert_eq!(cache.sync_old_buffers(), 0);
    assert_eq!(disk.writes(), 0);

    clock.advance(1);
    assert_eq!(cache.sync_old_buffers(), 1);
    assert_eq!(disk.writes(), 2);
    assert_eq!(disk.read_sectors(dev, 16, 2), vec![0x77; 1024]);
    let bh = cache.get_hash_table(dev, 8, 1024).unwrap().unwrap();
    assert!(!bh.is_dirty());
    assert_eq!(cache.stats().writebacks, 1);
}

#[test]
fn test_super_block_ages_faster() {
    let (cache, disk, dev, clock) =
        build(fixture::pool(64), RamDisk::new(DISK_SECTORS), CacheConfig::default());
    {
        let bh = cache.getblk(dev, 1, 1024).unwrap();
        bh.mark_uptodate();
        bh.mark_dirty_super();
    }
    clock.advance(u64::from(cache.bdflush_params().age_super));
    assert_eq!(cache.sync_old_buffers(), 1);
    assert_eq!(disk.writes(), 2);
}

#[test]
fn test_flush_now_cleans_dirty_list() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    for block in 20..23 {
        let bh = cache.getblk(dev, block, 1024).unwrap();
        bh.with_data_mut(|data| data.fill(block as u8));
        bh.mark_uptodate();
    }
    cache.flush_now(true);

    let stats = cache.stats();
    assert_eq!(stats.dirty(), 0);
    assert_eq!(stats.lists[Disposition::Dirty.index()].found, 0);
    for block in 20..23u64 {
        assert_eq!(disk.read_sectors(dev, block * 2, 2), vec![block as u8; 1024]);
    }
    cache.check_consistency();
}

#[test]
fn test_dirty_threshold_wakes_writeback() {
    // 四个缓冲区，超过 25% 即两个变脏时唤醒 bdflush；守护线程没有运行时就地同步
    let (cache, disk, dev) = ramdisk_cache(fixture::pool_with_reserve(2, 1));
    for block in 0..3 {
        let bh = cache.getblk(dev, block, 1024).unwrap();
        bh.mark_uptodate();
        bh.with_data_mut(|data| data.fill(block as u8 + 1));
    }
    assert_eq!(cache.stats().nr_buffers, 4);
    assert_eq!(disk.writes(), 4);
    assert_eq!(cache.stats().dirty(), 1);
    assert_eq!(disk.read_sectors(dev, 2, 2), vec![2u8; 1024]);
}

#[test]
fn test_fsync_dev_only_touches_device() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    let other = DeviceId::new(MAJOR, 1);
    // 两个脏缓冲区不能触发整体写回
    cache.set_bdflush_param(Param::Nfract, 100).unwrap();
    assert_eq!(cache.bdflush_param(Param::Nfract), 100);
    assert!(cache.set_bdflush_param(Param::Nfract, 101).is_err());
    for d in [dev, other] {
        let bh = cache.getblk(d, 3, 1024).unwrap();
        bh.with_data_mut(|data| data.fill(9));
        bh.mark_uptodate();
    }
    cache.fsync_dev(dev).unwrap();
    assert!(!cache.get_hash_table(dev, 3, 1024).unwrap().unwrap().is_dirty());
    assert!(cache.get_hash_table(other, 3, 1024).unwrap().unwrap().is_dirty());
    assert_eq!(disk.read_sectors(other, 6, 1), vec![0u8; 512]);
}

//=============================================================================
// 请求层
//=============================================================================

#[test]
fn test_breada_coalesces_into_one_request() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    let run = (cache.read_ahead(MAJOR) >> BlockSize::B1024.index()) as u64;
    assert_eq!(run, 4);

    let bh = cache.breada(dev, 0, 1024, 0, 64 * 1024).unwrap().unwrap();
    assert!(bh.is_uptodate());
    assert_eq!(disk.requests(), 1);
    assert_eq!(disk.reads(), run * 2);
    for block in 1..run {
        assert!(cache.get_hash_table(dev, block, 1024).unwrap().unwrap().is_uptodate());
    }
    // 读到文件末尾之后
    assert!(cache.breada(dev, 9, 1024, 64 * 1024, 64 * 1024).unwrap().is_none());
}

#[test]
fn test_breada_capped_by_max_readahead() {
    let (cache, disk, dev, _clock) = build(
        fixture::pool(64),
        RamDisk::new(DISK_SECTORS).with_read_ahead(64),
        CacheConfig::default(),
    );
    assert_eq!(cache.read_ahead(MAJOR), 64);

    let bh = cache.breada(dev, 0, 1024, 0, 64 * 1024).unwrap().unwrap();
    assert!(bh.is_uptodate());
    // 设备允许 32 块，最多只读 16 块
    assert_eq!(disk.reads(), 32);
    assert_eq!(disk.requests(), 1);
    assert!(cache.get_hash_table(dev, 15, 1024).unwrap().unwrap().is_uptodate());
    assert!(cache.get_hash_table(dev, 16, 1024).unwrap().is_none());
}

#[test]
fn test_block_number_overflow_is_dropped() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    assert!(cache.bread(dev, u64::MAX, 1024).unwrap().is_none());
    assert!(cache.bread(dev, u64::MAX / 2, 1024).unwrap().is_none());
    assert!(cache.breada(dev, u64::MAX - 1, 1024, 0, 64 * 1024).unwrap().is_none());

    let bh = cache.get_hash_table(dev, u64::MAX / 2, 1024).unwrap().unwrap();
    assert!(!bh.is_locked());
    assert!(!bh.is_uptodate());
    drop(bh);

    let bh = cache.getblk(dev, u64::MAX, 1024).unwrap();
    bh.mark_uptodate();
    bh.with_data_mut(|data| data.fill(0xff));
    cache.ll_rw_block(RwMode::Write, &[&bh]).unwrap();
    assert!(!bh.is_dirty());
    assert!(!bh.is_locked());
    drop(bh);

    assert_eq!(disk.requests(), 0);
    assert_eq!(disk.writes(), 0);
    cache.check_consistency();
}

#[test]
fn test_driver_access_outside_request_is_refused() {
    let (cache, disk, dev, _clock) = build(
        fixture::pool(64),
        RamDisk::with_mode(DISK_SECTORS, Completion::Deferred),
        CacheConfig::default(),
    );
    let bh = cache.getblk(dev, 3, 1024).unwrap();
    // 没有加锁的缓冲区和不存在的描述符
    assert_eq!(cache.with_io_buffer(bh.id(), |data| data.len()), None);
    assert_eq!(cache.with_io_buffer_mut(usize::MAX, |data| data.len()), None);

    cache.ll_rw_block(RwMode::Read, &[&bh]).unwrap();
    assert_eq!(cache.with_io_buffer(bh.id(), |data| data.len()), Some(1024));
    assert_eq!(disk.run_queue(&cache, MAJOR), 1);
    assert!(bh.is_uptodate());
}

#[test]
fn test_ll_rw_page_waits_for_completion() {
    let (cache, disk, dev, _clock) = build(
        fixture::pool(64),
        RamDisk::with_mode(DISK_SECTORS, Completion::Deferred),
        CacheConfig::default(),
    );
    disk.write_sectors(dev, 8, &[0x42; PAGE_SIZE]);

    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0u8; PAGE_SIZE];
            cache.ll_rw_page(Command::Read, dev, 1, &mut buf).map(|()| buf)
        });
        let req = loop {
            if let Some(req) = cache.current_request(MAJOR) {
                break req;
            }
            std::thread::yield_now();
        };
        assert!(req.page.is_some());
        assert!(req.buffers.is_empty());
        assert_eq!((req.cmd, req.sector, req.nr_sectors), (Command::Read, 8, 8));
        // 排在页请求后面的缓冲区请求
        let next = cache.getblk(dev, 8, 1024).unwrap();
        cache.ll_rw_block(RwMode::ReadAhead, &[&next]).unwrap();
        assert_eq!(cache.queued_requests(MAJOR).len(), 2);

        assert_eq!(disk.run_queue(&cache, MAJOR), 2);
        assert_eq!(reader.join().unwrap().unwrap(), vec![0x42; PAGE_SIZE]);
        assert!(next.is_uptodate());
    });

    std::thread::scope(|s| {
        let writer = s.spawn(|| cache.ll_rw_page(Command::Write, dev, 2, &mut [7u8; PAGE_SIZE]));
        while cache.current_request(MAJOR).is_none() {
            std::thread::yield_now();
        }
        disk.run_queue(&cache, MAJOR);
        writer.join().unwrap().unwrap();
    });
    assert_eq!(disk.read_sectors(dev, 16, 8), vec![7u8; PAGE_SIZE]);
    // 页请求不经过缓存
    for block in 4..8 {
        assert!(cache.get_hash_table(dev, block, 1024).unwrap().is_none());
    }
}

#[test]
fn test_ll_rw_page_errors() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    let mut page = vec![0u8; PAGE_SIZE];

    let err = cache.ll_rw_page(Command::Read, dev, 0, &mut page[..512]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = cache.ll_rw_page(Command::Read, DeviceId::new(9, 0), 0, &mut page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDevice);
    let err = cache.ll_rw_page(Command::Read, dev, u64::MAX, &mut page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    cache.set_read_only(dev, true);
    let err = cache.ll_rw_page(Command::Write, dev, 0, &mut page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(cache.ll_rw_page(Command::Read, dev, 0, &mut page).is_ok());
    cache.set_read_only(dev, false);

    cache.set_device_size(dev, 8);
    let err = cache.ll_rw_page(Command::Read, dev, 2, &mut page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    disk.fail_sector(dev, 12);
    let err = cache.ll_rw_page(Command::Read, dev, 1, &mut page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(disk.requests(), 2);
    assert!(cache.current_request(MAJOR).is_none());
}

#[test]
fn test_ll_rw_swap_file_scatters_blocks() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    let mut page = vec![1u8; PAGE_SIZE];
    page[PAGE_SIZE / 2..].fill(2);

    // 两个 2 KiB 的交换块：第 5 块和第 2 块
    cache.ll_rw_swap_file(Command::Write, dev, &[5, 2], &mut page).unwrap();
    assert_eq!(disk.requests(), 2);
    assert_eq!(disk.read_sectors(dev, 20, 4), vec![1u8; PAGE_SIZE / 2]);
    assert_eq!(disk.read_sectors(dev, 8, 4), vec![2u8; PAGE_SIZE / 2]);

    let mut back = vec![0u8; PAGE_SIZE];
    cache.ll_rw_swap_file(Command::Read, dev, &[5, 2], &mut back).unwrap();
    assert_eq!(back, page);

    let err = cache.ll_rw_swap_file(Command::Read, dev, &[1, 2, 3], &mut back).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(cache.ll_rw_swap_file(Command::Read, dev, &[], &mut back).is_ok());
}

#[test]
fn test_read_error_yields_none() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    disk.fail_sector(dev, 21);
    assert!(cache.bread(dev, 10, 1024).unwrap().is_none());

    let bh = cache.get_hash_table(dev, 10, 1024).unwrap().unwrap();
    assert!(!bh.is_uptodate());
    assert!(!bh.is_locked());
    drop(bh);

    disk.clear_failures();
    assert!(cache.bread(dev, 10, 1024).unwrap().is_some());
}

#[test]
fn test_write_to_read_only_device() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    cache.set_read_only(dev, true);
    assert!(cache.is_read_only(dev));

    let bh = cache.getblk(dev, 4, 1024).unwrap();
    bh.with_data_mut(|data| data.fill(1));
    bh.mark_uptodate();
    let err = cache.ll_rw_block(RwMode::Write, &[&bh]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(bh.is_dirty());
    assert!(!bh.is_locked());
    assert_eq!(disk.writes(), 0);
    drop(bh);

    cache.set_read_only(dev, false);
    cache.fsync_dev(dev).unwrap();
    assert_eq!(disk.writes(), 2);
}

#[test]
fn test_unregistered_device() {
    let (cache, _disk, _dev) = ramdisk_cache(fixture::pool(64));
    let nodev = DeviceId::new(9, 0);
    let err = cache.bread(nodev, 1, 1024).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NoDevice);
    let bh = cache.get_hash_table(nodev, 1, 1024).unwrap().unwrap();
    assert!(!bh.is_uptodate());
    assert!(!bh.is_dirty());
}

#[test]
fn test_access_beyond_device_end_is_dropped() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    cache.set_device_size(dev, 4);
    assert!(cache.bread(dev, 3, 1024).unwrap().is_some());
    assert!(cache.bread(dev, 4, 1024).unwrap().is_none());
    assert_eq!(disk.requests(), 1);
}

#[test]
fn test_block_size_must_match_device() {
    let (cache, _disk, dev) = ramdisk_cache(fixture::pool(64));
    let bh = cache.getblk(dev, 2, 2048).unwrap();
    let err = cache.ll_rw_block(RwMode::Read, &[&bh]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!bh.is_locked());
}

#[test]
fn test_read_ahead_abandoned_when_pool_full() {
    let config = CacheConfig { nr_requests: 3, ..CacheConfig::default() };
    let (cache, disk, dev, _clock) =
        build(fixture::pool(64), RamDisk::with_mode(DISK_SECTORS, Completion::Deferred), config);

    let bhs: Vec<_> = [0u64, 10, 20, 30].iter().map(|&b| cache.getblk(dev, b, 1024).unwrap()).collect();
    for bh in &bhs {
        cache.ll_rw_block(RwMode::ReadAhead, &[bh]).unwrap();
    }
    assert_eq!(cache.queued_requests(MAJOR).len(), 3);
    assert!(bhs[0].is_locked());
    // 第四个没有拿到请求槽，直接放弃
    assert!(!bhs[3].is_locked());
    assert!(!bhs[3].is_uptodate());

    assert_eq!(disk.run_queue(&cache, MAJOR), 3);
    assert!(bhs[..3].iter().all(|bh| bh.is_uptodate() && !bh.is_locked()));
    assert!(cache.current_request(MAJOR).is_none());
}

#[test]
fn test_deferred_completion_wakes_waiter() {
    let (cache, disk, dev, _clock) = build(
        fixture::pool(64),
        RamDisk::with_mode(DISK_SECTORS, Completion::Deferred),
        CacheConfig::default(),
    );
    disk.write_sectors(dev, 2, &[3u8; 1024]);

    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let bh = cache.bread(dev, 1, 1024).unwrap().unwrap();
            bh.with_data(|data| data[0])
        });
        while cache.current_request(MAJOR).is_none() {
            std::thread::yield_now();
        }
        disk.run_queue(&cache, MAJOR);
        assert_eq!(reader.join().unwrap(), 3);
    });
}

//=============================================================================
// 守护线程与并发
//=============================================================================

#[test]
fn test_bdflush_daemon_lifecycle() {
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(64));
    let daemon = cache.spawn_bdflush().unwrap();
    assert!(cache.bdflush_running());
    assert_eq!(cache.spawn_bdflush().err().unwrap().kind(), ErrorKind::Busy);

    {
        let bh = cache.getblk(dev, 12, 1024).unwrap();
        bh.with_data_mut(|data| data.fill(0xee));
        bh.mark_uptodate();
    }
    // 守护线程可能正在进行的一轮没有看到这个缓冲区
    for _ in 0..10 {
        cache.flush_now(true);
        if cache.stats().dirty() == 0 {
            break;
        }
    }
    assert_eq!(cache.stats().dirty(), 0);
    assert_eq!(disk.read_sectors(dev, 24, 2), vec![0xee; 1024]);

    daemon.shutdown();
    assert!(!cache.bdflush_running());
    // 停止后可以重新启动
    drop(cache.spawn_bdflush().unwrap());
    assert!(!cache.bdflush_running());
}

#[test]
fn test_bdflush_keeps_going_while_over_threshold() {
    // 没有周期同步，守护线程只有在一轮之后仍然太脏时才会不睡眠地继续
    let config = CacheConfig { update_interval: None, ..CacheConfig::default() };
    let (cache, disk, dev, _clock) = build(fixture::pool(64), RamDisk::new(DISK_SECTORS), config);
    cache.set_bdflush_param(Param::Nfract, 100).unwrap();
    for block in 0..40 {
        let bh = cache.getblk(dev, block, 1024).unwrap();
        bh.mark_uptodate();
        bh.with_data_mut(|data| data.fill(block as u8));
    }
    assert_eq!(cache.stats().dirty(), 40);
    cache.set_bdflush_param(Param::Ndirty, 10).unwrap();
    cache.set_bdflush_param(Param::Nfract, 0).unwrap();

    let daemon = cache.spawn_bdflush().unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while cache.bdflush.cycles() < 4 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(cache.bdflush.cycles(), 4);
    assert_eq!(cache.stats().dirty(), 0);
    assert_eq!(disk.writes(), 80);
    daemon.shutdown();
}

#[test]
fn test_concurrent_writers_with_daemon() {
    const THREADS: u64 = 4;
    const BLOCKS: u64 = 16;
    let (cache, disk, dev) = ramdisk_cache(fixture::pool(16));
    let daemon = cache.spawn_bdflush().unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..200 {
                    let block = t * BLOCKS + i % BLOCKS;
                    let bh = cache.getblk(dev, block, 1024).unwrap();
                    // 先标记有效，并发的 bread 不会再发起读请求覆盖新内容
                    bh.mark_uptodate();
                    bh.with_data_mut(|data| data.fill(t as u8 + 1));
                    drop(bh);
                    if i % 7 == 0 {
                        // 读别的线程的块
                        let other = ((t + 1) % THREADS) * BLOCKS + i % BLOCKS;
                        drop(cache.bread(dev, other, 1024).unwrap());
                    }
                }
            });
        }
    });
    daemon.shutdown();

    cache.fsync_dev(dev).unwrap();
    cache.check_consistency();
    for t in 0..THREADS {
        for b in 0..BLOCKS {
            let block = t * BLOCKS + b;
            assert_eq!(disk.read_sectors(dev, block * 2, 2), vec![t as u8 + 1; 1024], "block {}", block);
        }
    }
}
