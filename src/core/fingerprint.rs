//! 内容指纹与持久化指纹缓存
//!
//! 缓存以 (修改时间, 大小) 作为有效性依据，两者完全一致时直接复用哈希，
//! 避免重复读取未变化的文件。

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 流式读取的块大小
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// 缓存文件格式版本，格式变化时递增
const CACHE_VERSION: u32 = 1;

/// 文件内容哈希计算接口
#[async_trait]
pub trait ContentHasher: Send + Sync {
    async fn hash_file(&self, path: &Path) -> SyncResult<String>;
}

/// BLAKE3 全量哈希（256 位）
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

#[async_trait]
impl ContentHasher for Blake3Hasher {
    async fn hash_file(&self, path: &Path) -> SyncResult<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_file_blocking(&path)).await?
    }
}

/// 同步版本，按固定块大小流式读取，内存占用与文件大小无关
pub fn hash_file_blocking(path: &Path) -> SyncResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| SyncError::io("打开文件", path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| SyncError::io("读取文件", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub mtime_ns: i64,
    pub size: u64,
    pub hash: String,
}

/// 落盘格式
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    root: String,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// 本轮扫描中出现过的路径，保存时只保留这些
    seen: HashSet<String>,
}

/// 指纹缓存
///
/// 内存中的映射由互斥锁保护，多个哈希任务可以并发写入。
/// 持久化文件只在扫描开始前读一次、结束后写一次。
#[derive(Debug)]
pub struct FingerprintCache {
    path: Option<PathBuf>,
    root: String,
    state: Mutex<CacheState>,
}

impl FingerprintCache {
    /// 不落盘的缓存，仅在一次运行内有效
    pub fn in_memory() -> Self {
        Self {
            path: None,
            root: String::new(),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// 获取某个根目录对应的缓存文件路径
    pub fn cache_path(cache_dir: &Path, root: &Path) -> PathBuf {
        let key = blake3::hash(root.to_string_lossy().as_bytes());
        cache_dir.join(format!("{}.json", &key.to_hex()[..16]))
    }

    /// 从磁盘加载；文件不存在或损坏时退化为空缓存
    pub fn load(cache_dir: &Path, root: &Path) -> Self {
        let path = Self::cache_path(cache_dir, root);
        let root_str = root.to_string_lossy().into_owned();

        let entries = match Self::read_file(&path, &root_str) {
            Ok(entries) => {
                info!("加载指纹缓存 {} 条: {:?}", entries.len(), path);
                entries
            }
            Err(SyncError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!("指纹缓存不存在: {:?}", path);
                HashMap::new()
            }
            Err(e) => {
                warn!("{}，按空缓存处理", e);
                let _ = std::fs::remove_file(&path);
                HashMap::new()
            }
        };

        Self {
            path: Some(path),
            root: root_str,
            state: Mutex::new(CacheState {
                entries,
                seen: HashSet::new(),
            }),
        }
    }

    fn read_file(path: &Path, root: &str) -> SyncResult<HashMap<String, CacheEntry>> {
        let data = std::fs::read(path).map_err(|e| SyncError::io("读取缓存", path, e))?;
        let file: CacheFile = serde_json::from_slice(&data).map_err(|e| SyncError::Cache {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if file.version != CACHE_VERSION || file.root != root {
            return Err(SyncError::Cache {
                path: path.to_path_buf(),
                reason: "版本或根目录不匹配".to_string(),
            });
        }

        Ok(file.entries)
    }

    /// 元数据完全一致时返回缓存的哈希
    pub async fn lookup(&self, rel_path: &str, mtime_ns: i64, size: u64) -> Option<String> {
        let mut state = self.state.lock().await;
        state.seen.insert(rel_path.to_string());
        state
            .entries
            .get(rel_path)
            .filter(|e| e.mtime_ns == mtime_ns && e.size == size)
            .map(|e| e.hash.clone())
    }

    /// 记录新计算的哈希
    pub async fn record(&self, rel_path: &str, mtime_ns: i64, size: u64, hash: &str) {
        let mut state = self.state.lock().await;
        state.seen.insert(rel_path.to_string());
        state.entries.insert(
            rel_path.to_string(),
            CacheEntry {
                mtime_ns,
                size,
                hash: hash.to_string(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 写回磁盘；只保留本轮出现过的路径。失败只影响下次性能
    pub async fn save(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let entries = {
            let mut state = self.state.lock().await;
            let seen = std::mem::take(&mut state.seen);
            state.entries.retain(|k, _| seen.contains(k));
            state.entries.clone()
        };

        let count = entries.len();
        let file = CacheFile {
            version: CACHE_VERSION,
            root: self.root.clone(),
            entries,
        };
        let data = serde_json::to_vec(&file).map_err(|e| SyncError::Cache {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Cache {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(path, data)
            .await
            .map_err(|e| SyncError::Cache {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        debug!("已保存指纹缓存 {} 条到 {:?}", count, path);
        Ok(())
    }
}
