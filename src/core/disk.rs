use std::path::Path;

/// 查询路径所在卷的可用空间（字节），平台不支持或查询失败时返回 None
#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    match rustix::fs::statvfs(path) {
        Ok(stat) => Some(stat.f_bavail.saturating_mul(stat.f_frsize)),
        Err(e) => {
            tracing::debug!("查询可用空间失败 {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Option<u64> {
    None
}
