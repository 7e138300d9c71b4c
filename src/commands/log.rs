//! 日志设置命令

use crate::logging::LogConfig;
use anyhow::bail;
use std::path::Path;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 更新并保存日志配置，未指定的字段保持不变
pub fn update_log_config(
    config_dir: &Path,
    enabled: Option<bool>,
    max_size_mb: Option<u32>,
    level: Option<String>,
) -> anyhow::Result<LogConfig> {
    let mut config = LogConfig::load(config_dir);

    if let Some(e) = enabled {
        config.enabled = e;
    }
    if let Some(size) = max_size_mb {
        // 限制范围 1-100 MB
        config.max_size_mb = size.clamp(1, 100);
    }
    if let Some(l) = level {
        let l = l.to_lowercase();
        if !VALID_LEVELS.contains(&l.as_str()) {
            bail!("无效的日志级别: {}", l);
        }
        config.level = l;
    }

    config.save(config_dir)?;
    Ok(config)
}
