//! 每个主设备号一条请求队列
//!
//! 队列头是驱动正在处理的请求，永远不会被重新排序或合并。
//! 队列被“塞住”（plugged）时相当于队列头是一个占位请求：新请求排在它后面，
//! 驱动也不会被启动，直到整批请求都入队后再拔掉占位。

use super::request::{Request, RequestPool};

#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    entries: Vec<usize>,
    plugged: bool,
}

impl RequestQueue {
    /// 队列中没有任何请求，也没有被塞住
    pub fn is_idle(&self) -> bool {
        self.entries.is_empty() && !self.plugged
    }

    /// 队列为空时塞住队列
    ///
    /// # 返回
    ///
    /// 本次调用是否塞住了队列
    pub fn plug(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.plugged = true;
        true
    }

    /// 拔掉占位请求
    ///
    /// # 返回
    ///
    /// 队列中是否有请求需要驱动处理
    pub fn unplug(&mut self) -> bool {
        self.plugged = false;
        !self.entries.is_empty()
    }

    /// 驱动当前应处理的请求槽位
    pub fn head(&self) -> Option<usize> {
        if self.plugged {
            return None;
        }
        self.entries.first().copied()
    }

    /// 移除队列头
    pub fn pop_head(&mut self) -> Option<usize> {
        if self.plugged || self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0))
    }

    pub fn slots(&self) -> &[usize] {
        &self.entries
    }

    /// 可以合并或插入到其前面的第一个位置（跳过正在处理的队列头）
    fn first_movable(&self) -> usize {
        if self.plugged {
            0
        } else {
            1
        }
    }

    /// 按电梯顺序插入请求
    ///
    /// # 返回
    ///
    /// 队列原本空闲、需要启动驱动时返回 `true`
    pub fn add(&mut self, pool: &RequestPool, slot: usize) -> bool {
        if self.is_idle() {
            self.entries.push(slot);
            return true;
        }
        let Some(req) = pool.get(slot) else {
            return false;
        };
        let mut pos = self.entries.len();
        for i in self.first_movable()..self.entries.len() {
            let Some(next) = pool.get(self.entries[i]) else {
                continue;
            };
            let fits = match i.checked_sub(1).and_then(|p| pool.get(self.entries[p])) {
                Some(prev) => (prev.in_order(req) || !prev.in_order(next)) && req.in_order(next),
                // 占位请求排在一切请求之前
                None => req.in_order(next),
            };
            if fits {
                pos = i;
                break;
            }
        }
        self.entries.insert(pos, slot);
        false
    }

    /// 尝试把一个缓冲区并入已经排队的相邻请求
    ///
    /// 向后合并：请求的结束扇区正好是新缓冲区的起始扇区。
    /// 向前合并：新缓冲区正好结束在请求的起始扇区。
    /// 两者都要求设备、命令一致，且请求长度小于 `max_sectors`。
    /// 页请求既不并入别的请求，也不接受别的请求并入。
    pub fn try_merge(&self, pool: &mut RequestPool, new: &Request, max_sectors: u32) -> bool {
        let Some(&id) = new.buffers.first() else {
            return false;
        };
        if !new.is_mergeable() {
            return false;
        }
        for &slot in &self.entries[self.first_movable().min(self.entries.len())..] {
            let Some(req) = pool.get_mut(slot) else {
                continue;
            };
            if !req.is_mergeable() || req.dev != new.dev || req.cmd != new.cmd || req.nr_sectors >= max_sectors {
                continue;
            }
            if req.sector.checked_add(u64::from(req.nr_sectors)) == Some(new.sector) {
                req.buffers.push(id);
                req.nr_sectors += new.nr_sectors;
                return true;
            }
            if req.sector.checked_sub(u64::from(new.nr_sectors)) == Some(new.sector) {
                req.buffers.insert(0, id);
                req.sector = new.sector;
                req.nr_sectors += new.nr_sectors;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::request::PageTransfer;
    use crate::types::{Command, DeviceId};

    const DEV: DeviceId = DeviceId::new(3, 0);

    fn enqueue(q: &mut RequestQueue, pool: &mut RequestPool, cmd: Command, sector: u64) -> usize {
        let slot = pool.get_request(pool.len(), Request::new(DEV, cmd, sector, 2, sector as usize)).unwrap();
        q.add(pool, slot);
        slot
    }

    fn order(q: &RequestQueue, pool: &RequestPool) -> Vec<(u64, Command)> {
        q.slots().iter().map(|&s| pool.get(s).map(|r| (r.sector, r.cmd)).unwrap()).collect()
    }

    #[test]
    fn test_elevator_order_when_plugged() {
        let mut pool = RequestPool::new(8);
        let mut q = RequestQueue::default();
        assert!(q.plug());
        enqueue(&mut q, &mut pool, Command::Read, 500);
        enqueue(&mut q, &mut pool, Command::Write, 200);
        enqueue(&mut q, &mut pool, Command::Read, 100);
        assert_eq!(
            order(&q, &pool),
            vec![(100, Command::Read), (500, Command::Read), (200, Command::Write)]
        );
        assert_eq!(q.head(), None);
        assert!(q.unplug());
        assert_eq!(q.head().and_then(|s| pool.get(s)).map(|r| r.sector), Some(100));
    }

    #[test]
    fn test_head_never_displaced() {
        let mut pool = RequestPool::new(8);
        let mut q = RequestQueue::default();
        let head = pool.get_request(8, Request::new(DEV, Command::Write, 500, 2, 0)).unwrap();
        // 空闲队列插入第一个请求时需要启动驱动
        assert!(q.add(&pool, head));
        enqueue(&mut q, &mut pool, Command::Read, 300);
        enqueue(&mut q, &mut pool, Command::Read, 100);
        assert_eq!(
            order(&q, &pool),
            vec![(500, Command::Write), (100, Command::Read), (300, Command::Read)]
        );
        assert_eq!(q.pop_head(), Some(head));
    }

    #[test]
    fn test_merge() {
        let mut pool = RequestPool::new(8);
        let mut q = RequestQueue::default();
        q.plug();
        let slot = enqueue(&mut q, &mut pool, Command::Read, 10);

        // 向后合并
        assert!(q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 12, 2, 1), 244));
        // 向前合并
        assert!(q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 8, 2, 2), 244));
        // 命令不同不合并
        assert!(!q.try_merge(&mut pool, &Request::new(DEV, Command::Write, 14, 2, 3), 244));
        // 设备不同不合并
        let other = DeviceId::new(3, 1);
        assert!(!q.try_merge(&mut pool, &Request::new(other, Command::Read, 14, 2, 4), 244));

        let req = pool.get(slot).unwrap();
        assert_eq!(req.sector, 8);
        assert_eq!(req.nr_sectors, 6);
        assert_eq!(req.buffers, vec![2, 10, 1]);

        // 达到长度上限后不再合并
        assert!(!q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 14, 2, 5), 6));
    }

    #[test]
    fn test_merge_skips_active_head() {
        let mut pool = RequestPool::new(8);
        let mut q = RequestQueue::default();
        enqueue(&mut q, &mut pool, Command::Read, 10);
        assert!(!q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 12, 2, 1), 244));
    }

    #[test]
    fn test_page_request_never_merges() {
        let mut pool = RequestPool::new(8);
        let mut q = RequestQueue::default();
        q.plug();
        let page = PageTransfer::new(vec![0u8; 4096]);
        let slot = pool.get_request(8, Request::for_page(DEV, Command::Read, 16, page)).unwrap();
        q.add(&pool, slot);

        // 紧跟在页请求前后的缓冲区不能并入
        assert!(!q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 24, 2, 1), 244));
        assert!(!q.try_merge(&mut pool, &Request::new(DEV, Command::Read, 14, 2, 2), 244));
        assert_eq!(pool.get(slot).map(|r| (r.sector, r.nr_sectors)), Some((16, 8)));

        // 页请求本身也不并入缓冲区请求
        enqueue(&mut q, &mut pool, Command::Read, 40);
        let next = PageTransfer::new(vec![0u8; 4096]);
        assert!(!q.try_merge(&mut pool, &Request::for_page(DEV, Command::Read, 42, next), 244));
        assert_eq!(q.slots().len(), 2);
    }
}
