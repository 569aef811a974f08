//! 错误类型定义
//!
//! 缓冲区缓存和请求层共用一个错误类型：一个类别加一条静态消息。
//! 底层原因（例如线程创建失败的 `io::Error`）在出错处写入日志，不随错误传递。

use core::fmt;

/// 缓冲区缓存操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数（块大小、块号、参数值越界）
    InvalidInput,
    /// 同一块以不同块大小缓存
    Corrupted,
    /// 写只读设备
    PermissionDenied,
    /// 页分配器无法提供页
    NoSpace,
    /// 主设备号没有注册驱动
    NoDevice,
    /// bdflush 已经在运行
    Busy,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 错误类别
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
