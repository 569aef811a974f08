//! 底层读写：把缓冲区变成请求并交给驱动
//!
//! 对每个缓冲区：已经满足要求的跳过（写但不脏、读但已有效），否则加锁，
//! 优先并入相邻的已排队请求，不能合并时从请求池取一个槽位按电梯顺序入队。
//! 请求池满时普通请求等待，预读/预写请求直接放弃。
//!
//! `ll_rw_page` / `ll_rw_swap_file` 绕过缓存：请求自带数据区和完成信号，
//! 提交者等到驱动完成为止。
//!
//! 请求层锁与缓存结构锁从不同时持有。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::device::{BlockDriver, DeviceTable};
use super::queue::RequestQueue;
use super::request::{PageTransfer, Request, RequestInfo, RequestPool};
use crate::cache::{BufferCache, BufferFlags, BufferHandle};
use crate::consts::{PAGE_SIZE, SECTOR_SHIFT, SECTOR_SIZE};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{BlockSize, BufferId, Command, DeviceId, RwMode};

pub(crate) struct BlkInner {
    pool: RequestPool,
    queues: BTreeMap<u8, RequestQueue>,
    devices: DeviceTable,
    drivers: BTreeMap<u8, Arc<dyn BlockDriver>>,
}

/// 请求层：请求池、每个主设备号的队列、设备表和驱动
pub(crate) struct RequestLayer {
    inner: Mutex<BlkInner>,
    /// 请求槽位释放时通知
    wait_for_request: Condvar,
}

impl RequestLayer {
    pub fn new(nr_requests: usize) -> Self {
        Self {
            inner: Mutex::new(BlkInner {
                pool: RequestPool::new(nr_requests),
                queues: BTreeMap::new(),
                devices: DeviceTable::default(),
                drivers: BTreeMap::new(),
            }),
            wait_for_request: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_size(&self, dev: DeviceId) -> Option<BlockSize> {
        self.lock().devices.block_size(dev)
    }

    pub fn set_block_size(&self, dev: DeviceId, size: BlockSize) {
        self.lock().devices.set_block_size(dev, size);
    }

    fn driver(&self, major: u8) -> Option<Arc<dyn BlockDriver>> {
        self.lock().drivers.get(&major).cloned()
    }
}

impl BufferCache {
    //=========================================================================
    // 设备注册与属性
    //=========================================================================

    /// 注册主设备号的驱动
    ///
    /// 预读扇区数取驱动声明的值，未声明时取 `default_read_ahead`
    pub fn register_driver(&self, major: u8, driver: Arc<dyn BlockDriver>) {
        let read_ahead = driver.read_ahead().unwrap_or(self.config.default_read_ahead);
        let mut blk = self.blk.lock();
        blk.devices.set_read_ahead(major, read_ahead);
        blk.queues.entry(major).or_default();
        if blk.drivers.insert(major, driver).is_some() {
            log::warn!("[BLK] driver for major {} replaced", major);
        }
        log::info!("[BLK] registered driver for major {} (read-ahead {} sectors)", major, read_ahead);
    }

    /// 声明设备大小（KiB），超出范围的块请求会被丢弃
    pub fn set_device_size(&self, dev: DeviceId, kb: u64) {
        self.blk.lock().devices.set_size_kb(dev, kb);
    }

    /// 设置设备只读
    pub fn set_read_only(&self, dev: DeviceId, ro: bool) {
        self.blk.lock().devices.set_read_only(dev, ro);
    }

    /// 设备是否只读
    pub fn is_read_only(&self, dev: DeviceId) -> bool {
        self.blk.lock().devices.is_read_only(dev)
    }

    /// 设置主设备号的预读扇区数
    pub fn set_read_ahead(&self, major: u8, sectors: u32) {
        self.blk.lock().devices.set_read_ahead(major, sectors);
    }

    /// 主设备号的预读扇区数，未注册时为 0
    pub fn read_ahead(&self, major: u8) -> u32 {
        self.blk.lock().devices.read_ahead(major)
    }

    //=========================================================================
    // 提交
    //=========================================================================

    /// 为一批缓冲区发出读写请求
    ///
    /// 不等待完成；需要结果时对缓冲区调用 [`BufferHandle::wait`]。
    ///
    /// # 参数
    ///
    /// * `rw` - 读、写、预读或预写
    /// * `bhs` - 缓冲区
    ///
    /// # 返回
    ///
    /// - `NoDevice` - 设备没有驱动，整批缓冲区被标记为无效且干净
    /// - `InvalidInput` - 块大小与设备块大小不一致，处理同上
    /// - `PermissionDenied` - 写只读设备，缓冲区状态不变
    pub fn ll_rw_block(&self, rw: RwMode, bhs: &[&BufferHandle<'_>]) -> Result<()> {
        let ids: Vec<BufferId> = bhs.iter().map(|bh| bh.id()).collect();
        self.submit(rw, &ids)
    }

    /// 调用者已经持有 `ids` 中每个缓冲区的引用
    pub(crate) fn submit(&self, rw: RwMode, ids: &[BufferId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let targets: Vec<(BufferId, Option<DeviceId>, BlockSize)> = {
            let st = self.lock_state();
            ids.iter()
                .map(|&id| {
                    let bh = st.head(id);
                    (id, bh.dev, bh.size)
                })
                .collect()
        };

        let mut limits: BTreeMap<DeviceId, Option<u64>> = BTreeMap::new();
        let checked = {
            let blk = self.blk.lock();
            let checked = targets.iter().try_for_each(|&(id, dev, size)| {
                let Some(dev) = dev else {
                    log::error!("[BLK] buffer {} is not bound to a device", id);
                    return Err(Error::new(ErrorKind::InvalidInput, "buffer not bound to a device"));
                };
                if !blk.drivers.contains_key(&dev.major()) {
                    log::error!("[BLK] trying to access nonexistent block device {}", dev);
                    return Err(Error::new(ErrorKind::NoDevice, "nonexistent block device"));
                }
                let expected = blk.devices.block_size(dev).unwrap_or_default();
                if size != expected {
                    log::error!(
                        "[BLK] device {}: block size {} does not match device block size {}",
                        dev,
                        size.bytes(),
                        expected.bytes()
                    );
                    return Err(Error::new(ErrorKind::InvalidInput, "block size does not match device"));
                }
                if rw.command() == Command::Write && blk.devices.is_read_only(dev) {
                    log::error!("[BLK] can't write to read-only device {}", dev);
                    return Err(Error::new(ErrorKind::PermissionDenied, "device is read-only"));
                }
                limits.insert(dev, blk.devices.size_sectors(dev));
                Ok(())
            });
            checked
        };
        if let Err(e) = checked {
            if e.kind() != ErrorKind::PermissionDenied {
                self.fail_batch(ids);
            }
            return Err(e);
        }

        // 一次提交多个缓冲区时先塞住空闲队列，整批入队后再启动驱动
        let mut plugged: Vec<u8> = if ids.len() > 1 {
            let majors: BTreeSet<u8> = limits.keys().map(|dev| dev.major()).collect();
            let mut blk = self.blk.lock();
            let plugged = majors
                .into_iter()
                .filter(|major| blk.queues.entry(*major).or_default().plug())
                .collect();
            plugged
        } else {
            Vec::new()
        };

        for &(id, dev, _) in &targets {
            let limit = dev.and_then(|dev| limits.get(&dev).copied().flatten());
            self.make_request(rw, id, limit, &mut plugged);
        }
        self.release_plugs(&mut plugged);
        Ok(())
    }

    /// 拔掉本批塞住的队列并启动驱动
    ///
    /// 提交过程中需要等待（缓冲区加锁、请求池已满）时也要先调用，
    /// 否则等待的对象可能正排在被自己塞住的队列里。
    fn release_plugs(&self, plugged: &mut Vec<u8>) {
        for major in plugged.drain(..) {
            let pending = self.blk.lock().queues.get_mut(&major).is_some_and(RequestQueue::unplug);
            if pending {
                self.kick(major);
            }
        }
    }

    /// 设备或块大小无效：清除整批缓冲区的脏与有效标志
    fn fail_batch(&self, ids: &[BufferId]) {
        let mut st = self.lock_state();
        let now = self.now();
        for &id in ids {
            st.mark_clean(id, now);
            st.head_mut(id).flags.remove(BufferFlags::UPTODATE);
        }
        drop(st);
    }

    /// 为单个缓冲区建立请求
    ///
    /// `limit` 是设备大小（扇区），越界的块被丢弃
    fn make_request(&self, rw: RwMode, id: BufferId, limit: Option<u64>, plugged: &mut Vec<u8>) {
        let cmd = rw.command();
        let now = self.now();
        let mut st = self.lock_state();
        let bh = st.head(id);
        let Some(dev) = bh.dev else {
            return;
        };
        let count = bh.size.sectors();
        // 扇区号溢出的块和越过设备大小的块一样处理
        let span = bh.sector().and_then(|sector| Some((sector, sector.checked_add(u64::from(count))?)));
        let sector = match span {
            Some((sector, end)) if limit.map_or(true, |max| end <= max) => sector,
            _ => {
                log::error!("[BLK] attempt to access beyond end of device {} (block {})", dev, bh.blocknr);
                st.mark_clean(id, now);
                st.head_mut(id).flags.remove(BufferFlags::UPTODATE | BufferFlags::REQ);
                drop(st);
                return;
            }
        };

        while st.head(id).is_locked() {
            if rw.is_ahead() {
                return;
            }
            if !plugged.is_empty() {
                drop(st);
                self.release_plugs(plugged);
                st = self.lock_state();
                continue;
            }
            st = self.wait_on_buffer(st, id);
        }
        st.head_mut(id).flags.insert(BufferFlags::LOCKED);
        let (was_dirty, uptodate) = (st.head(id).is_dirty(), st.head(id).is_uptodate());
        if (cmd == Command::Write && !was_dirty) || (cmd == Command::Read && uptodate) {
            self.unlock_buffer(&mut st, id);
            drop(st);
            return;
        }
        st.head_mut(id).flags.insert(BufferFlags::REQ);
        if cmd == Command::Write {
            st.mark_clean(id, now);
        }
        drop(st);

        let mut req = Request::new(dev, cmd, sector, count, id);
        let major = dev.major();
        let max_merge = self.config.max_merge_sectors;
        let mut blk = self.blk.lock();
        let kick = loop {
            let inner = &mut *blk;
            let queue = inner.queues.entry(major).or_default();
            if queue.try_merge(&mut inner.pool, &req, max_merge) {
                log::trace!("[BLK] merged block {} of {} into a queued request", sector, dev);
                break false;
            }
            let total = inner.pool.len();
            let limit = if cmd == Command::Read { total } else { total * 2 / 3 };
            match inner.pool.get_request(limit, req) {
                Ok(slot) => break queue.add(&inner.pool, slot),
                Err(back) => {
                    req = back;
                    if rw.is_ahead() {
                        drop(blk);
                        self.abandon_request(id, was_dirty);
                        return;
                    }
                    if !plugged.is_empty() {
                        drop(blk);
                        self.release_plugs(plugged);
                        blk = self.blk.lock();
                        continue;
                    }
                    log::debug!("[BLK] waiting for a free request ({} in use)", blk.pool.in_use());
                    blk = self.blk.wait_for_request.wait(blk).unwrap_or_else(PoisonError::into_inner);
                }
            }
        };
        drop(blk);
        if kick {
            self.kick(major);
        }
    }

    /// 请求池已满，放弃预读/预写：恢复脏标志并解锁
    fn abandon_request(&self, id: BufferId, was_dirty: bool) {
        let now = self.now();
        let mut st = self.lock_state();
        let bh = st.head_mut(id);
        bh.flags.remove(BufferFlags::REQ);
        if was_dirty {
            bh.flags.insert(BufferFlags::DIRTY);
            st.set_writetime(id, false, now);
        }
        self.unlock_buffer(&mut st, id);
        if st.head(id).is_bound() {
            st.refile(id, now);
        }
        drop(st);
        log::warn!("[BLK] request pool exhausted, buffer {} read/write-ahead abandoned", id);
    }

    //=========================================================================
    // 页读写
    //=========================================================================

    /// 同步读写一页，不经过缓冲区缓存
    ///
    /// 第 `page` 页从扇区 `page * PAGE_SIZE / 512` 开始。页请求独占一个请求槽，
    /// 不与其他请求合并；调用者阻塞到驱动完成为止。
    ///
    /// # 参数
    ///
    /// * `cmd` - 读或写
    /// * `dev` - 设备
    /// * `page` - 设备上的页号
    /// * `buf` - 一页大小的数据区，读时用读到的内容覆盖
    ///
    /// # 返回
    ///
    /// - `NoDevice` - 设备没有驱动
    /// - `PermissionDenied` - 写只读设备
    /// - `InvalidInput` - `buf` 不是一页大小，或页越过设备末尾
    /// - `Io` - 驱动报告 I/O 错误
    pub fn ll_rw_page(&self, cmd: Command, dev: DeviceId, page: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "page buffer must be exactly one page"));
        }
        let Some(sector) = page.checked_mul((PAGE_SIZE / SECTOR_SIZE) as u64) else {
            log::error!("[BLK] page {} of device {} is out of range", page, dev);
            return Err(Error::new(ErrorKind::InvalidInput, "page number out of range"));
        };
        self.transfer_page(cmd, dev, sector, buf)
    }

    /// 按交换文件的块表同步读写一页
    ///
    /// `buf` 平均分成 `blocks.len()` 段，第 `i` 段对应设备上的第 `blocks[i]` 块，
    /// 块大小就是段长。每段一个请求，依次提交并等待完成。
    ///
    /// # 参数
    ///
    /// * `cmd` - 读或写
    /// * `dev` - 交换文件所在的设备
    /// * `blocks` - 每一段所在的块号
    /// * `buf` - 数据区，长度必须能按段整分且每段是整数个扇区
    ///
    /// # 返回
    ///
    /// 同 [`BufferCache::ll_rw_page`]；出错时后面的段不再提交
    pub fn ll_rw_swap_file(&self, cmd: Command, dev: DeviceId, blocks: &[u64], buf: &mut [u8]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let chunk = buf.len() / blocks.len();
        if chunk == 0 || chunk % SECTOR_SIZE != 0 || chunk * blocks.len() != buf.len() {
            log::error!("[BLK] swap buffer of {} bytes can't be split into {} blocks", buf.len(), blocks.len());
            return Err(Error::new(ErrorKind::InvalidInput, "swap buffer does not split into whole sectors"));
        }
        let per_block = (chunk >> SECTOR_SHIFT) as u64;
        for (&block, part) in blocks.iter().zip(buf.chunks_mut(chunk)) {
            let Some(sector) = block.checked_mul(per_block) else {
                log::error!("[BLK] swap block {} of device {} is out of range", block, dev);
                return Err(Error::new(ErrorKind::InvalidInput, "swap block out of range"));
            };
            self.transfer_page(cmd, dev, sector, part)?;
        }
        Ok(())
    }

    /// 提交一个页请求并等待完成
    fn transfer_page(&self, cmd: Command, dev: DeviceId, sector: u64, buf: &mut [u8]) -> Result<()> {
        let major = dev.major();
        let nr_sectors = (buf.len() >> SECTOR_SHIFT) as u64;
        let page = PageTransfer::new(match cmd {
            Command::Read => vec![0u8; buf.len()],
            Command::Write => buf.to_vec(),
        });
        let mut req = Request::for_page(dev, cmd, sector, page.clone());

        let mut blk = self.blk.lock();
        if !blk.drivers.contains_key(&major) {
            log::error!("[BLK] trying to page nonexistent block device {} (sector {})", dev, sector);
            return Err(Error::new(ErrorKind::NoDevice, "nonexistent block device"));
        }
        if cmd == Command::Write && blk.devices.is_read_only(dev) {
            log::error!("[BLK] can't page to read-only device {}", dev);
            return Err(Error::new(ErrorKind::PermissionDenied, "device is read-only"));
        }
        let limit = blk.devices.size_sectors(dev);
        match sector.checked_add(nr_sectors) {
            Some(end) if limit.map_or(true, |max| end <= max) => {}
            _ => {
                log::error!("[BLK] attempt to page beyond end of device {} (sector {})", dev, sector);
                return Err(Error::new(ErrorKind::InvalidInput, "page beyond end of device"));
            }
        }

        let kick = loop {
            let inner = &mut *blk;
            let total = inner.pool.len();
            match inner.pool.get_request(total, req) {
                Ok(slot) => break inner.queues.entry(major).or_default().add(&inner.pool, slot),
                Err(back) => {
                    req = back;
                    log::debug!("[BLK] page request waiting for a free request ({} in use)", inner.pool.in_use());
                    blk = self.blk.wait_for_request.wait(blk).unwrap_or_else(PoisonError::into_inner);
                }
            }
        };
        drop(blk);
        if kick {
            self.kick(major);
        }

        if !page.wait() {
            return Err(Error::new(ErrorKind::Io, "page I/O error"));
        }
        if cmd == Command::Read {
            page.copy_to(buf);
        }
        Ok(())
    }

    /// 启动驱动
    fn kick(&self, major: u8) {
        if let Some(driver) = self.blk.driver(major) {
            driver.request_fn(self, major);
        }
    }

    //=========================================================================
    // 驱动接口
    //=========================================================================

    /// 驱动应处理的队列头；队列空或被塞住时为 `None`
    pub fn current_request(&self, major: u8) -> Option<RequestInfo> {
        let blk = self.blk.lock();
        let slot = blk.queues.get(&major)?.head()?;
        blk.pool.get(slot).map(Request::info)
    }

    /// 队列中全部请求（队列头在前）
    pub fn queued_requests(&self, major: u8) -> Vec<RequestInfo> {
        let blk = self.blk.lock();
        let Some(queue) = blk.queues.get(&major) else {
            return Vec::new();
        };
        queue.slots().iter().filter_map(|&slot| blk.pool.get(slot).map(Request::info)).collect()
    }

    /// 完成队列头请求
    ///
    /// 成功时把请求中的缓冲区标记为有效；失败时读缓冲区保持无效，
    /// 写缓冲区重新变脏，留给下一次写回。然后解锁、重新归档、唤醒等待者。
    /// 页请求只唤醒等在它上面的提交者。
    ///
    /// # 返回
    ///
    /// 新的队列头
    pub fn end_request(&self, major: u8, uptodate: bool) -> Option<RequestInfo> {
        let (req, next) = {
            let mut blk = self.blk.lock();
            let inner = &mut *blk;
            let queue = inner.queues.get_mut(&major)?;
            let slot = queue.pop_head()?;
            let req = inner.pool.free(slot)?;
            let next = queue.head().and_then(|s| inner.pool.get(s)).map(Request::info);
            self.blk.wait_for_request.notify_all();
            (req, next)
        };

        if !uptodate {
            log::error!(
                "[BLK] I/O error: dev {}, {:?} sector {} ({} sectors)",
                req.dev,
                req.cmd,
                req.sector,
                req.nr_sectors
            );
        }
        if let Some(page) = &req.page {
            page.complete(uptodate);
            return next;
        }
        let now = self.now();
        let mut st = self.lock_state();
        for &id in &req.buffers {
            let bh = st.head_mut(id);
            if uptodate {
                bh.flags.insert(BufferFlags::UPTODATE);
            } else if req.cmd == Command::Write {
                bh.flags.insert(BufferFlags::DIRTY);
                st.set_writetime(id, false, now);
            } else {
                bh.flags.remove(BufferFlags::UPTODATE);
            }
            self.unlock_buffer(&mut st, id);
            if st.head(id).is_bound() {
                st.refile(id, now);
            }
        }
        drop(st);
        next
    }
}
