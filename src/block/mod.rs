//! 块设备请求层
//!
//! - `request.rs`: 请求与固定大小的请求池；页请求的数据区 [`PageTransfer`]
//! - `queue.rs`: 每个主设备号的请求队列，电梯排序、相邻请求合并、塞住/拔出
//! - `ll_rw.rs`: `ll_rw_block`，把缓冲区变成请求；`ll_rw_page` / `ll_rw_swap_file`
//!   同步读写整页；驱动回调 `end_request`
//! - `device.rs`: 驱动接口 [`BlockDriver`] 与设备属性表
//! - `ramdisk.rs`: 内存盘驱动 [`RamDisk`]，用于测试和模拟

mod device;
mod ll_rw;
mod queue;
mod ramdisk;
mod request;

pub use device::BlockDriver;
pub use ramdisk::{Completion, RamDisk};
pub use request::{PageTransfer, RequestInfo};

pub(crate) use ll_rw::RequestLayer;
