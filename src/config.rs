//! 应用配置模块
//!
//! 所有配置保存在 `<配置目录>/config.json`，每个关注点占一个顶层小节
//! （`sync`、`log`），读写时互不覆盖。

use crate::core::engine::SyncConfig;
use crate::core::filter::ExclusionFilter;
use crate::core::retry::RetryPolicy;
use crate::core::scanner::default_hash_workers;
use crate::core::SNAPSHOT_DIR_PREFIX;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

/// 默认配置目录 `<用户配置目录>/synctree`
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("synctree"))
        .unwrap_or_else(|| PathBuf::from(".synctree"))
}

/// 默认指纹缓存目录 `<用户缓存目录>/synctree/fingerprints`
pub fn default_cache_dir() -> PathBuf {
    crate::dirs::cache_dir()
        .map(|p| p.join("synctree"))
        .unwrap_or_else(|| PathBuf::from(".synctree"))
        .join("fingerprints")
}

/// 读取配置文件中的一个小节；文件缺失或内容无效时返回 None
pub fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content)
        .inspect_err(|e| tracing::warn!("配置文件格式错误: {}", e))
        .ok()?;
    let section = config.get(key)?.clone();
    serde_json::from_value(section)
        .inspect_err(|e| tracing::warn!("配置小节 {} 无效: {}", key, e))
        .ok()
}

/// 写入一个小节，保留其他小节
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> anyhow::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
        Err(_) => serde_json::json!({}),
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value)?;

    fs::create_dir_all(config_dir)
        .with_context(|| format!("创建配置目录失败: {:?}", config_dir))?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("写入配置文件失败: {:?}", config_file))?;
    Ok(())
}

/// 同步设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default)]
    pub source_folder: Option<PathBuf>,
    #[serde(default)]
    pub destination_folder: Option<PathBuf>,
    /// 排除的目录名片段，按子串匹配，不区分大小写
    #[serde(default = "default_excluded_folders")]
    pub excluded_folders: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 0 表示自动
    #[serde(default)]
    pub hash_workers: usize,
    #[serde(default = "default_true")]
    pub parallel_hashing: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// 为空时使用默认缓存目录
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_excluded_folders() -> Vec<String> {
    vec![SNAPSHOT_DIR_PREFIX.to_string()]
}

fn default_max_workers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            source_folder: None,
            destination_folder: None,
            excluded_folders: default_excluded_folders(),
            max_workers: default_max_workers(),
            hash_workers: 0,
            parallel_hashing: true,
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            cache_enabled: true,
            cache_dir: None,
        }
    }
}

impl SyncSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        save_section(config_dir, "sync", self)
    }

    /// 实际使用的哈希并发数
    pub fn effective_hash_workers(&self) -> usize {
        match (self.parallel_hashing, self.hash_workers) {
            (false, _) => 1,
            (true, 0) => default_hash_workers(),
            (true, n) => n,
        }
    }

    /// 生成引擎配置；源和目标必须已设置
    pub fn to_config(&self) -> anyhow::Result<SyncConfig> {
        let source = self
            .source_folder
            .clone()
            .context("未设置源目录 (--source 或配置文件 sync.sourceFolder)")?;
        let destination = self
            .destination_folder
            .clone()
            .context("未设置目标目录 (--dest 或配置文件 sync.destinationFolder)")?;

        let cache_dir = self
            .cache_enabled
            .then(|| self.cache_dir.clone().unwrap_or_else(default_cache_dir));

        Ok(SyncConfig {
            source,
            destination,
            filter: ExclusionFilter::new(&self.excluded_folders),
            max_workers: self.max_workers.max(1),
            hash_workers: self.effective_hash_workers(),
            retry: RetryPolicy::new(
                self.retry_attempts,
                Duration::from_millis(self.retry_delay_ms),
            ),
            cache_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load(dir.path());
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.retry_delay_ms, 1000);
        assert!(settings.cache_enabled);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"sync": {"maxWorkers": 2, "excludedFolders": ["node_modules"]}}"#,
        )
        .unwrap();

        let settings = SyncSettings::load(dir.path());
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.excluded_folders, vec!["node_modules"]);
        assert_eq!(settings.retry_attempts, 3);
    }

    #[test]
    fn test_sections_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        save_section(dir.path(), "log", &serde_json::json!({"level": "debug"})).unwrap();

        let settings = SyncSettings {
            source_folder: Some(PathBuf::from("/data/src")),
            ..Default::default()
        };
        settings.save(dir.path()).unwrap();

        assert_eq!(SyncSettings::load(dir.path()), settings);
        let log: serde_json::Value = load_section(dir.path(), "log").unwrap();
        assert_eq!(log["level"], "debug");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert_eq!(SyncSettings::load(dir.path()), SyncSettings::default());
    }

    #[test]
    fn test_to_config_requires_roots() {
        assert!(SyncSettings::default().to_config().is_err());

        let settings = SyncSettings {
            source_folder: Some(PathBuf::from("/a")),
            destination_folder: Some(PathBuf::from("/b")),
            hash_workers: 3,
            cache_enabled: false,
            ..Default::default()
        };
        let config = settings.to_config().unwrap();
        assert_eq!(config.source, PathBuf::from("/a"));
        assert_eq!(config.hash_workers, 3);
        assert!(config.cache_dir.is_none());
        assert!(config.filter.is_excluded("backup_before_restore_20240101_120000"));
    }

    #[test]
    fn test_serial_hashing() {
        let settings = SyncSettings {
            parallel_hashing: false,
            hash_workers: 16,
            ..Default::default()
        };
        assert_eq!(settings.effective_hash_workers(), 1);
    }
}
