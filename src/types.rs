//! 缓冲区缓存的基础类型定义
//!
//! ## 设计原则
//!
//! 1. **强类型标识** - 设备号、块大小、命令都用独立类型表示
//! 2. **有序关系** - `DeviceId` 与 `Command` 的排序即电梯算法使用的顺序
//! 3. **辅助方法** - 提供大小等级、扇区数之类的换算

use core::fmt;

use crate::consts::*;

//=============================================================================
// 设备号
//=============================================================================

/// 设备号（主设备号 + 次设备号）
///
/// 排序按 `(major << 8) | minor` 的数值进行，这也是请求队列中
/// "设备号升序" 的含义。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u16);

impl DeviceId {
    /// 由主、次设备号构造
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | minor as u16)
    }

    /// 由原始 16 位设备号构造
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// 主设备号（决定驱动与请求队列）
    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// 次设备号
    pub const fn minor(self) -> u8 {
        self.0 as u8
    }

    /// 原始 16 位设备号
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.major(), self.minor())
    }
}

//=============================================================================
// 块大小
//=============================================================================

/// 支持的块大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockSize {
    /// 512 字节
    B512,
    /// 1024 字节
    B1024,
    /// 2048 字节
    B2048,
    /// 4096 字节
    B4096,
}

impl BlockSize {
    /// 全部大小等级，按 `index()` 顺序排列
    pub const ALL: [BlockSize; NR_SIZES] =
        [BlockSize::B512, BlockSize::B1024, BlockSize::B2048, BlockSize::B4096];

    /// 由字节数构造，不支持的大小返回 `None`
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            512 => Some(BlockSize::B512),
            1024 => Some(BlockSize::B1024),
            2048 => Some(BlockSize::B2048),
            4096 => Some(BlockSize::B4096),
            _ => None,
        }
    }

    /// 字节数
    pub const fn bytes(self) -> usize {
        SECTOR_SIZE << self.index()
    }

    /// 大小等级索引（0..NR_SIZES）
    pub const fn index(self) -> usize {
        match self {
            BlockSize::B512 => 0,
            BlockSize::B1024 => 1,
            BlockSize::B2048 => 2,
            BlockSize::B4096 => 3,
        }
    }

    /// 每块的扇区数
    pub const fn sectors(self) -> u32 {
        1 << self.index()
    }

    /// 每页能切出的缓冲区数
    pub const fn per_page(self) -> usize {
        PAGE_SIZE / self.bytes()
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::B1024
    }
}

//=============================================================================
// I/O 命令
//=============================================================================

/// 请求命令
///
/// `Read < Write`，电梯算法让读请求排在写请求前面。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    /// 读
    Read,
    /// 写
    Write,
}

/// `ll_rw_block` 的操作方式
///
/// `ReadAhead`/`WriteAhead` 是尽力而为的操作：缓冲区已加锁或请求池已满时直接放弃，
/// 不会阻塞调用者。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwMode {
    /// 读
    Read,
    /// 写
    Write,
    /// 预读
    ReadAhead,
    /// 尽力写
    WriteAhead,
}

impl RwMode {
    /// 对应的请求命令
    pub const fn command(self) -> Command {
        match self {
            RwMode::Read | RwMode::ReadAhead => Command::Read,
            RwMode::Write | RwMode::WriteAhead => Command::Write,
        }
    }

    /// 是否为尽力而为的操作
    pub const fn is_ahead(self) -> bool {
        matches!(self, RwMode::ReadAhead | RwMode::WriteAhead)
    }
}

//=============================================================================
// 处置链表
//=============================================================================

/// 已绑定缓冲区所在的处置链表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// 干净
    Clean,
    /// 曾经被共享、现在不再共享
    Unshared,
    /// 正在 I/O
    Locked,
    /// 正在 I/O，且最近才由超级块写出（保留更久）
    LockedRecent,
    /// 脏
    Dirty,
    /// 所在页被映射共享
    Shared,
}

impl Disposition {
    /// 全部链表，按 `index()` 顺序排列
    pub const ALL: [Disposition; NR_LIST] = [
        Disposition::Clean,
        Disposition::Unshared,
        Disposition::Locked,
        Disposition::LockedRecent,
        Disposition::Dirty,
        Disposition::Shared,
    ];

    /// 链表索引
    pub const fn index(self) -> usize {
        match self {
            Disposition::Clean => 0,
            Disposition::Unshared => 1,
            Disposition::Locked => 2,
            Disposition::LockedRecent => 3,
            Disposition::Dirty => 4,
            Disposition::Shared => 5,
        }
    }

    /// 链表名称（用于统计输出）
    pub const fn name(self) -> &'static str {
        match self {
            Disposition::Clean => "CLEAN",
            Disposition::Unshared => "UNSHARED",
            Disposition::Locked => "LOCKED",
            Disposition::LockedRecent => "LOCKED1",
            Disposition::Dirty => "DIRTY",
            Disposition::Shared => "SHARED",
        }
    }
}

/// 缓冲区描述符在描述符池中的索引
pub type BufferId = usize;
