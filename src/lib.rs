//! bcache_core: 块设备缓冲区缓存
//!
//! 位于块设备驱动和文件系统之间的统一缓冲区缓存，提供：
//! - **按 (设备, 块号) 查找**的缓冲区，块大小 512/1024/2048/4096
//! - **延迟写回**：脏缓冲区按刷新期限由 bdflush 守护线程写出
//! - **按需增长与回收**：从页分配器切分页，内存紧张时整页归还
//! - **请求层**：电梯排序、相邻请求合并、批量提交时塞住队列
//!
//! # 示例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bcache_core::{BufferCache, CacheConfig, DeviceId, FixedPagePool, RamDisk, Result, SystemClock};
//!
//! fn main() -> Result<()> {
//!     let pool = Arc::new(FixedPagePool::with_memory(8 * 1024 * 1024));
//!     let cache = Arc::new(BufferCache::new(pool, Arc::new(SystemClock::new()), CacheConfig::default())?);
//!     cache.register_driver(3, Arc::new(RamDisk::new(8192)));
//!     let daemon = cache.spawn_bdflush()?;
//!
//!     let dev = DeviceId::new(3, 0);
//!     let bh = cache.getblk(dev, 1, 1024)?;
//!     bh.mark_uptodate();
//!     bh.with_data_mut(|data| data.fill(0));
//!     drop(bh);
//!
//!     cache.fsync_dev(dev)?;
//!     daemon.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`cache`] - 缓冲区缓存
//! - [`block`] - 请求层与块设备驱动接口
//! - [`bdflush`] - 写回守护线程与调优参数
//! - [`page`] - 页分配器接口
//! - [`clock`] - 节拍时钟
//! - [`config`] - 缓存配置
//! - [`consts`] - 常量定义
//! - [`types`] - 基础类型

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 基础类型
pub mod types;

/// 缓存配置
pub mod config;

/// 节拍时钟
pub mod clock;

/// 页分配器
pub mod page;

/// 缓冲区缓存
pub mod cache;

/// 请求层与块设备驱动
pub mod block;

/// 写回守护线程
pub mod bdflush;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 基础类型
pub use types::{BlockSize, BufferId, Command, DeviceId, Disposition, RwMode};

// 配置与环境
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use page::{FixedPagePool, Gfp, Page, PageAllocator, PageFrame};

// Cache
pub use cache::{
    BufferCache, BufferFlags, BufferHandle, CacheStats, FsSync, ListStats, PageData, SharedPage,
    SizeStats,
};

// 块设备
pub use block::{BlockDriver, Completion, PageTransfer, RamDisk, RequestInfo};

// bdflush
pub use bdflush::{BdflushHandle, BdflushParams, Param};
