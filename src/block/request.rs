//! I/O 请求与请求池
//!
//! 请求池是固定大小的槽位数组。写请求只能使用前 2/3 的槽位，
//! 给读请求留出余量。
//!
//! 请求有两种：缓冲区请求携带一条缓冲区链；页请求不经过缓存，
//! 自带一段数据和完成信号，提交者同步等待它完成。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::types::{BufferId, Command, DeviceId};

/// 一个待处理的磁盘传输：从 `sector` 开始的连续 `nr_sectors` 个扇区
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub dev: DeviceId,
    pub cmd: Command,
    pub sector: u64,
    pub nr_sectors: u32,
    /// 按扇区顺序排列的缓冲区链
    pub buffers: Vec<BufferId>,
    /// 页请求的数据与完成信号；缓冲区请求为 `None`
    pub page: Option<PageTransfer>,
}

impl Request {
    pub fn new(dev: DeviceId, cmd: Command, sector: u64, nr_sectors: u32, id: BufferId) -> Self {
        Self { dev, cmd, sector, nr_sectors, buffers: vec![id], page: None }
    }

    /// 不经过缓冲区的页请求
    pub fn for_page(dev: DeviceId, cmd: Command, sector: u64, page: PageTransfer) -> Self {
        let nr_sectors = page.sectors();
        Self { dev, cmd, sector, nr_sectors, buffers: Vec::new(), page: Some(page) }
    }

    /// 页请求不参与合并
    pub fn is_mergeable(&self) -> bool {
        self.page.is_none()
    }

    /// 电梯排序关系：读在写之前，然后按设备号、起始扇区升序
    pub fn in_order(&self, other: &Request) -> bool {
        (self.cmd, self.dev, self.sector) < (other.cmd, other.dev, other.sector)
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            dev: self.dev,
            cmd: self.cmd,
            sector: self.sector,
            nr_sectors: self.nr_sectors,
            buffers: self.buffers.clone(),
            page: self.page.clone(),
        }
    }
}

//=============================================================================
// 页请求
//=============================================================================

#[derive(Debug)]
struct PageIo {
    data: Mutex<Vec<u8>>,
    /// 完成结果：`Some(true)` 成功，`Some(false)` I/O 错误
    done: Mutex<Option<bool>>,
    completed: Condvar,
}

/// 页请求的数据区与完成信号
///
/// 驱动通过 [`RequestInfo::page`] 拿到它，用 [`PageTransfer::with_data`] /
/// [`PageTransfer::with_data_mut`] 搬运数据；[`BufferCache::end_request`](crate::BufferCache::end_request)
/// 完成请求时唤醒提交者。
#[derive(Debug, Clone)]
pub struct PageTransfer(Arc<PageIo>);

impl PageTransfer {
    /// 以 `data` 为初始内容建立一次传输
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self(Arc::new(PageIo {
            data: Mutex::new(data),
            done: Mutex::new(None),
            completed: Condvar::new(),
        }))
    }

    /// 数据长度对应的扇区数
    pub(crate) fn sectors(&self) -> u32 {
        (lock(&self.0.data).len() >> crate::consts::SECTOR_SHIFT) as u32
    }

    /// 读取传输数据（写请求时驱动从这里取数据）
    pub fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let data = lock(&self.0.data);
        f(data.as_slice())
    }

    /// 修改传输数据（读请求时驱动把数据放到这里）
    pub fn with_data_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut data = lock(&self.0.data);
        f(data.as_mut_slice())
    }

    /// 标记完成并唤醒等待者
    pub(crate) fn complete(&self, uptodate: bool) {
        *lock(&self.0.done) = Some(uptodate);
        self.0.completed.notify_all();
    }

    /// 等待完成，返回是否成功
    pub(crate) fn wait(&self) -> bool {
        let mut done = lock(&self.0.done);
        loop {
            if let Some(ok) = *done {
                return ok;
            }
            done = self.0.completed.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 取回数据
    pub(crate) fn copy_to(&self, buf: &mut [u8]) {
        let data = lock(&self.0.data);
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
    }
}

impl PartialEq for PageTransfer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PageTransfer {}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 请求的只读快照，供驱动和检查使用
///
/// 驱动按 `buffers` 的顺序传输数据：第一个缓冲区从 `sector` 开始，
/// 后面的缓冲区紧跟在前一个之后。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// 设备号
    pub dev: DeviceId,
    /// 读或写
    pub cmd: Command,
    /// 起始扇区
    pub sector: u64,
    /// 扇区数
    pub nr_sectors: u32,
    /// 参与传输的缓冲区
    pub buffers: Vec<BufferId>,
    /// 页请求的数据区；此时 `buffers` 为空
    pub page: Option<PageTransfer>,
}

/// 固定大小的请求池
pub(crate) struct RequestPool {
    slots: Vec<Option<Request>>,
    prev_found: usize,
    prev_limit: usize,
}

impl RequestPool {
    pub fn new(nr_requests: usize) -> Self {
        Self {
            slots: (0..nr_requests).map(|_| None).collect(),
            prev_found: 0,
            prev_limit: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// 正在使用的槽位数
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// 在前 `limit` 个槽位中找一个空闲槽位放入 `req`
    ///
    /// 从上一次找到的位置向前循环搜索。没有空闲槽位时把请求交还给调用者。
    pub fn get_request(&mut self, limit: usize, req: Request) -> Result<usize, Request> {
        let limit = limit.clamp(1, self.slots.len());
        if limit != self.prev_limit {
            self.prev_limit = limit;
            self.prev_found = 0;
        }
        let mut idx = self.prev_found;
        loop {
            idx = if idx == 0 { limit - 1 } else { idx - 1 };
            if self.slots[idx].is_none() {
                break;
            }
            if idx == self.prev_found {
                return Err(req);
            }
        }
        self.prev_found = idx;
        self.slots[idx] = Some(req);
        Ok(idx)
    }

    /// 释放槽位，返回其中的请求
    pub fn free(&mut self, slot: usize) -> Option<Request> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn get(&self, slot: usize) -> Option<&Request> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Request> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }
}
