//! 缓冲区描述符
//!
//! 每个描述符描述一个物理页中的一段固定大小的区域：要么绑定到某个
//! (设备, 块号)，要么挂在对应大小等级的空闲链表上。

use bitflags::bitflags;

use crate::types::{BlockSize, BufferId, DeviceId, Disposition};

bitflags! {
    /// 缓冲区状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        /// 数据有效
        const UPTODATE = 0x01;
        /// 数据比磁盘上的新
        const DIRTY    = 0x02;
        /// I/O 进行中，独占访问
        const LOCKED   = 0x04;
        /// 已经为当前内容发出过 I/O 请求
        const REQ      = 0x08;
    }
}

/// 缓冲区描述符
///
/// 描述符保存在缓存状态的描述符池中，通过 [`BufferId`] 索引。
/// 链表与哈希链都存在外部结构里，描述符只记录自己属于哪个链表。
///
/// # 字段说明
///
/// - `dev`: `None` 表示在空闲链表上
/// - `count`: 引用计数，大于 0 时不得回收或改变身份
/// - `list`: 已绑定时所在的处置链表
/// - `hashed`: 是否在哈希索引中
/// - `lru_time`: 最近一次重新归档的时间
/// - `flushtime`: 脏缓冲区的刷新期限，0 表示没有期限
/// - `page` / `offset`: 所在页的槽位与页内偏移
/// - `in_use`: 为 `false` 时描述符在未使用池中，没有对应的页
#[derive(Debug, Clone)]
pub(crate) struct BufferHead {
    pub dev: Option<DeviceId>,
    pub blocknr: u64,
    pub size: BlockSize,
    pub flags: BufferFlags,
    pub count: u32,
    pub list: Disposition,
    pub hashed: bool,
    pub lru_time: u64,
    pub flushtime: u64,
    pub page: usize,
    pub offset: usize,
    pub in_use: bool,
    pub id: BufferId,
}

impl BufferHead {
    pub fn new(id: BufferId) -> Self {
        Self {
            dev: None,
            blocknr: 0,
            size: BlockSize::default(),
            flags: BufferFlags::empty(),
            count: 0,
            list: Disposition::Clean,
            hashed: false,
            lru_time: 0,
            flushtime: 0,
            page: usize::MAX,
            offset: 0,
            in_use: false,
            id,
        }
    }

    /// 增加引用计数
    pub fn get(&mut self) {
        self.count += 1;
    }

    /// 减少引用计数
    ///
    /// # 返回
    ///
    /// 计数已经为 0 时返回 `false`，计数不变
    pub fn put(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    pub fn is_referenced(&self) -> bool {
        self.count > 0
    }

    /// 是否绑定到某个设备块
    pub fn is_bound(&self) -> bool {
        self.in_use && self.dev.is_some()
    }

    /// 是否在空闲链表上
    pub fn is_free(&self) -> bool {
        self.in_use && self.dev.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BufferFlags::DIRTY)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(BufferFlags::LOCKED)
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(BufferFlags::UPTODATE)
    }

    /// 身份是否为 (dev, block)
    pub fn matches(&self, dev: DeviceId, block: u64) -> bool {
        self.dev == Some(dev) && self.blocknr == block
    }

    /// 初始化为新绑定的缓冲区：引用为 1，清除全部状态标志
    pub fn bind(&mut self, dev: DeviceId, block: u64) {
        self.dev = Some(dev);
        self.blocknr = block;
        self.flags = BufferFlags::empty();
        self.count = 1;
        self.list = Disposition::Clean;
        self.flushtime = 0;
    }

    /// 起始扇区号；块号大到扇区号无法表示时为 `None`
    pub fn sector(&self) -> Option<u64> {
        self.blocknr.checked_mul(u64::from(self.size.sectors()))
    }
}
