//! bdflush：脏缓冲区写回
//!
//! - `params.rs`: 九个可调参数及其取值范围、持久化镜像
//! - `daemon.rs`: 守护线程、唤醒与周期同步

mod daemon;
mod params;

pub use daemon::BdflushHandle;
pub use params::{BdflushParams, Param, PARAM_MAX, PARAM_MIN};

pub(crate) use daemon::BdflushControl;
