//! 缓冲区缓存常量定义
//!
//! 这个模块包含了缓冲区缓存和请求层使用的常量，包括：
//! - 页面与扇区布局
//! - 块大小等级
//! - 处置链表数量
//! - 请求池与合并限制
//! - 负载均值的定点数参数

//=============================================================================
// 基础常量
//=============================================================================

/// 物理页大小（字节）
pub const PAGE_SIZE: usize = 4096;

/// 扇区大小（字节）
pub const SECTOR_SIZE: usize = 512;

/// 扇区大小的位移量（`1 << 9 == 512`）
pub const SECTOR_SHIFT: u32 = 9;

/// 默认块大小（设备未设置块大小时使用）
pub const BLOCK_SIZE: usize = 1024;

/// 每个页面最多容纳的缓冲区数（按最小块大小计算）
pub const MAX_BUF_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 时钟频率（每秒 jiffies 数）
pub const HZ: u64 = 100;

//=============================================================================
// 块大小等级与链表
//=============================================================================

/// 支持的块大小等级数（512、1024、2048、4096）
pub const NR_SIZES: usize = 4;

/// 处置链表数量（CLEAN、UNSHARED、LOCKED、LOCKED1、DIRTY、SHARED）
pub const NR_LIST: usize = 6;

//=============================================================================
// 哈希表
//=============================================================================

/// 内存小于 4 MiB 时的哈希桶数
pub const NR_HASH_SMALL: usize = 997;

/// 内存小于 16 MiB 时的哈希桶数
pub const NR_HASH_MEDIUM: usize = 4093;

/// 内存不小于 16 MiB 时的哈希桶数
pub const NR_HASH_LARGE: usize = 16381;

/// 小内存档位上限
pub const HASH_TIER_SMALL: usize = 4 * 1024 * 1024;

/// 中内存档位上限
pub const HASH_TIER_MEDIUM: usize = 16 * 1024 * 1024;

//=============================================================================
// 增长与回收
//=============================================================================

/// 空闲缓冲区数超过此值时 `refill_freelist` 不做任何事
pub const REFILL_THRESHOLD: usize = 100;

/// `reassign_cluster` 之前把空闲链表填充到的数量
pub const CLUSTER_FREE_TARGET: usize = 32;

/// 只有空闲页数超过此值时才在选举失败后继续普通增长
pub const CRITICAL_FREE_PAGES: usize = 5;

/// 跨大小等级再平衡时使用的回收优先级
pub const LAV_SHRINK_PRIORITY: u32 = 6;

//=============================================================================
// 请求层
//=============================================================================

/// 请求池大小
pub const NR_REQUEST: usize = 64;

/// 单个请求合并后的最大扇区数
pub const MAX_MERGE_SECTORS: u32 = 244;

/// `breada` 一次最多处理的块数
pub const NBUF: usize = 16;

/// 注册驱动时默认的预读扇区数
pub const DEFAULT_READ_AHEAD: u32 = 8;

//=============================================================================
// 负载均值（定点数）
//=============================================================================

/// 定点数小数位数
pub const FSHIFT: u32 = 11;

/// 定点数 1.0
pub const FIXED_1: u64 = 1 << FSHIFT;

/// bdflush 参数个数
pub const N_PARAM: usize = 9;

/// bdflush 参数表的持久化镜像大小（字节）
pub const PARAM_IMAGE_SIZE: usize = N_PARAM * 4;
