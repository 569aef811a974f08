//! 时钟抽象
//!
//! 缓存用 jiffies（每秒 [`HZ`](crate::consts::HZ) 个节拍）表示 LRU 时间戳与刷新期限。

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::consts::HZ;

/// 时钟 trait
///
/// 提供单调递增的节拍计数
///
/// # 示例
///
/// ```rust,ignore
/// struct TimerClock;
/// impl Clock for TimerClock {
///     fn jiffies(&self) -> u64 {
///         read_timer_ticks()
///     }
/// }
/// ```
pub trait Clock: Send + Sync {
    /// 当前节拍数
    fn jiffies(&self) -> u64;
}

/// 基于 `std::time::Instant` 的时钟
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// 创建时钟，节拍从 0 开始
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn jiffies(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() * HZ + u64::from(elapsed.subsec_millis()) * HZ / 1000
    }
}

/// 手动推进的时钟
///
/// 主要用于测试：刷新期限和 LRU 时间戳完全由调用者控制。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// 创建时钟，初始节拍为 `start`
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    /// 向前推进 `ticks` 个节拍
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    /// 直接设置当前节拍
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn jiffies(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
