//! 内存块设备驱动
//!
//! 每个次设备号一块独立的内存盘。`Immediate` 模式在 `request_fn` 里同步完成
//! 全部请求；`Deferred` 模式只记录被启动的次数，由调用者之后调用
//! [`RamDisk::run_queue`] 完成请求，模拟中断到来的时机。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use super::device::BlockDriver;
use super::request::RequestInfo;
use crate::cache::BufferCache;
use crate::consts::SECTOR_SIZE;
use crate::types::{Command, DeviceId};

/// 请求完成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// 在 `request_fn` 中同步完成
    Immediate,
    /// 等待 `run_queue`
    Deferred,
}

/// 内存盘驱动
pub struct RamDisk {
    sectors: u64,
    mode: Completion,
    disks: Mutex<BTreeMap<DeviceId, Vec<u8>>>,
    bad_sectors: Mutex<BTreeSet<(DeviceId, u64)>>,
    running: Mutex<()>,
    pending: AtomicBool,
    read_ahead: Option<u32>,
    reads: AtomicU64,
    writes: AtomicU64,
    requests: AtomicU64,
    kicks: AtomicU64,
}

impl RamDisk {
    /// 创建同步完成的内存盘
    ///
    /// # 参数
    ///
    /// * `sectors` - 每个次设备的扇区数
    pub fn new(sectors: u64) -> Self {
        Self::with_mode(sectors, Completion::Immediate)
    }

    /// 创建指定完成方式的内存盘
    pub fn with_mode(sectors: u64, mode: Completion) -> Self {
        Self {
            sectors,
            mode,
            disks: Mutex::new(BTreeMap::new()),
            bad_sectors: Mutex::new(BTreeSet::new()),
            running: Mutex::new(()),
            pending: AtomicBool::new(false),
            read_ahead: None,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
        }
    }

    /// 声明预读扇区数
    pub fn with_read_ahead(mut self, sectors: u32) -> Self {
        self.read_ahead = Some(sectors);
        self
    }

    /// 每个次设备的扇区数
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// 大小（KiB），用于 [`BufferCache::set_device_size`]
    pub fn size_kb(&self) -> u64 {
        self.sectors / 2
    }

    /// 让某个扇区之后的每次访问都失败
    pub fn fail_sector(&self, dev: DeviceId, sector: u64) {
        lock(&self.bad_sectors).insert((dev, sector));
    }

    /// 清除全部坏扇区
    pub fn clear_failures(&self) {
        lock(&self.bad_sectors).clear();
    }

    /// 读过的扇区数
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// 写过的扇区数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// 完成的请求数
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// 被启动的次数
    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }

    /// 直接读取盘上的内容（不经过缓存）
    pub fn read_sectors(&self, dev: DeviceId, sector: u64, count: u64) -> Vec<u8> {
        let mut disks = lock(&self.disks);
        let disk = self.disk(&mut disks, dev);
        let start = (sector as usize) * SECTOR_SIZE;
        let end = ((sector + count) as usize * SECTOR_SIZE).min(disk.len());
        disk.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// 直接写入盘上的内容（不经过缓存）
    pub fn write_sectors(&self, dev: DeviceId, sector: u64, data: &[u8]) {
        let mut disks = lock(&self.disks);
        let disk = self.disk(&mut disks, dev);
        let start = (sector as usize) * SECTOR_SIZE;
        let end = (start + data.len()).min(disk.len());
        if start < end {
            disk[start..end].copy_from_slice(&data[..end - start]);
        }
    }

    fn disk<'a>(&self, disks: &'a mut BTreeMap<DeviceId, Vec<u8>>, dev: DeviceId) -> &'a mut Vec<u8> {
        let bytes = self.sectors as usize * SECTOR_SIZE;
        disks.entry(dev).or_insert_with(|| vec![0u8; bytes])
    }

    /// 完成队列中的全部请求
    ///
    /// 多个线程同时调用时只有一个真正处理队列，其余的交给它继续处理。
    ///
    /// # 返回
    ///
    /// 本次完成的请求数
    pub fn run_queue(&self, cache: &BufferCache, major: u8) -> usize {
        self.pending.store(true, Ordering::SeqCst);
        let mut done = 0;
        while self.pending.load(Ordering::SeqCst) {
            let guard = match self.running.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => break,
            };
            self.pending.store(false, Ordering::SeqCst);
            while let Some(req) = cache.current_request(major) {
                let ok = self.transfer(cache, &req);
                cache.end_request(major, ok);
                done += 1;
            }
            drop(guard);
        }
        done
    }

    /// 搬运一个请求的数据
    fn transfer(&self, cache: &BufferCache, req: &RequestInfo) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let Some(end) = req.sector.checked_add(u64::from(req.nr_sectors)).filter(|&end| end <= self.sectors) else {
            log::error!("[BLK] ramdisk {}: sector {} beyond end of disk", req.dev, req.sector);
            return false;
        };
        let failed = lock(&self.bad_sectors)
            .range((req.dev, req.sector)..(req.dev, end))
            .next()
            .is_some();
        if failed {
            return false;
        }

        let mut disks = lock(&self.disks);
        let disk = self.disk(&mut disks, req.dev);
        let mut pos = req.sector as usize * SECTOR_SIZE;
        if let Some(page) = &req.page {
            let len = match req.cmd {
                Command::Read => page.with_data_mut(|data| {
                    data.copy_from_slice(&disk[pos..pos + data.len()]);
                    data.len()
                }),
                Command::Write => page.with_data(|data| {
                    disk[pos..pos + data.len()].copy_from_slice(data);
                    data.len()
                }),
            };
            pos += len;
        }
        for &id in &req.buffers {
            let moved = match req.cmd {
                Command::Read => cache.with_io_buffer_mut(id, |data| {
                    data.copy_from_slice(&disk[pos..pos + data.len()]);
                    data.len()
                }),
                Command::Write => cache.with_io_buffer(id, |data| {
                    disk[pos..pos + data.len()].copy_from_slice(data);
                    data.len()
                }),
            };
            let Some(len) = moved else {
                return false;
            };
            pos += len;
        }
        let counter = match req.cmd {
            Command::Read => &self.reads,
            Command::Write => &self.writes,
        };
        counter.fetch_add(u64::from(req.nr_sectors), Ordering::Relaxed);
        true
    }
}

impl BlockDriver for RamDisk {
    fn request_fn(&self, cache: &BufferCache, major: u8) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        if self.mode == Completion::Immediate {
            self.run_queue(cache, major);
        }
    }

    fn read_ahead(&self) -> Option<u32> {
        self.read_ahead
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
