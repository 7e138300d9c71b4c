//! 同步核心错误类型

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 同步核心错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 文件不可读写、权限不足或路径在操作中消失
    #[error("{op}失败: {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 目标磁盘剩余空间不足（预检估算）
    #[error("目标磁盘空间不足: 需要 {needed} 字节, 可用 {available} 字节")]
    Space { needed: u64, available: u64 },

    /// 指纹缓存不可读写（始终非致命）
    #[error("指纹缓存不可用: {}: {reason}", path.display())]
    Cache { path: PathBuf, reason: String },

    /// 源或目标根目录不存在
    #[error("目录不存在: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("操作已取消")]
    Cancelled,

    #[error("后台任务失败: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
