use crate::core::filter::ExclusionFilter;
use crate::core::fingerprint::{Blake3Hasher, ContentHasher, FingerprintCache};
use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 单个文件的扫描详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetail {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    /// 修改时间（Unix 纳秒）
    pub mtime_ns: i64,
    pub content_hash: Option<String>,
}

/// 路径扫描结果
#[derive(Debug, Clone, Default)]
pub struct PathScan {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub errors: Vec<String>,
}

/// 详情扫描结果
#[derive(Debug, Clone, Default)]
pub struct DetailScan {
    pub files: HashMap<String, FileDetail>,
    pub errors: Vec<String>,
    /// 实际读取内容计算哈希的文件数
    pub hashed: usize,
    /// 命中缓存的文件数
    pub cached: usize,
}

impl DetailScan {
    pub fn total_size(&self) -> u64 {
        folder_size(&self.files)
    }
}

/// 元数据阶段收集的待处理文件
#[derive(Debug)]
struct PendingFile {
    rel: String,
    abs: PathBuf,
    size: u64,
    mtime_ns: i64,
}

impl PendingFile {
    fn into_detail(self, hash: String) -> FileDetail {
        FileDetail {
            relative_path: self.rel,
            absolute_path: self.abs,
            size: self.size,
            mtime_ns: self.mtime_ns,
            content_hash: Some(hash),
        }
    }
}

/// 默认哈希并发数：可用并行度的两倍，上限 32
pub fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .min(32)
}

/// 计算相对路径，统一使用 `/` 分隔
pub fn relative_path(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

/// 把相对路径还原到某个根目录下
pub fn join_relative(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// 修改时间转换为 Unix 纳秒
pub fn mtime_ns(meta: &std::fs::Metadata) -> std::io::Result<i64> {
    let modified = meta.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => duration_to_ns(d),
        Err(e) => duration_to_ns(e.duration()).saturating_neg(),
    })
}

/// 纳秒数超出 `i64` 时取上限
fn duration_to_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// 详情映射中所有文件的总字节数
pub fn folder_size(files: &HashMap<String, FileDetail>) -> u64 {
    files.values().map(|f| f.size).sum()
}

/// 目录树扫描器
pub struct TreeScanner {
    filter: ExclusionFilter,
    hasher: Arc<dyn ContentHasher>,
    hash_workers: usize,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl TreeScanner {
    pub fn new(filter: ExclusionFilter) -> Self {
        Self {
            filter,
            hasher: Arc::new(Blake3Hasher),
            hash_workers: default_hash_workers(),
            cancel_flag: None,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = workers.max(1);
        self
    }

    /// 设置取消标志
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 遍历目录树，返回相对于 `base` 的文件与目录集合
    pub async fn scan_paths(&self, root: &Path, base: &Path) -> SyncResult<PathScan> {
        let root = root.to_path_buf();
        let base = base.to_path_buf();
        let filter = self.filter.clone();

        let scan = tokio::task::spawn_blocking(move || walk_paths(&root, &base, &filter)).await?;

        debug!(
            "路径扫描完成: {} 个文件, {} 个目录",
            scan.files.len(),
            scan.dirs.len()
        );
        Ok(scan)
    }

    /// 扫描文件详情（大小、修改时间、内容哈希）
    ///
    /// 先顺序收集元数据，再查缓存，只有需要重新计算的文件才进入哈希工作池。
    /// 单个文件出错只记录并跳过，不影响其他文件。
    pub async fn scan_details(
        &self,
        root: &Path,
        base: &Path,
        cache: Option<Arc<FingerprintCache>>,
    ) -> SyncResult<DetailScan> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let walk_root = root.to_path_buf();
        let walk_base = base.to_path_buf();
        let filter = self.filter.clone();
        let (pending, mut errors) =
            tokio::task::spawn_blocking(move || walk_metadata(&walk_root, &walk_base, &filter))
                .await?;

        let mut files = HashMap::with_capacity(pending.len());
        let mut to_hash = Vec::new();
        let mut cached = 0usize;

        for file in pending {
            if let Some(cache) = &cache {
                if let Some(hash) = cache.lookup(&file.rel, file.mtime_ns, file.size).await {
                    cached += 1;
                    files.insert(file.rel.clone(), file.into_detail(hash));
                    continue;
                }
            }
            to_hash.push(file);
        }

        debug!(
            "缓存命中 {} 个文件, {} 个文件需要计算哈希",
            cached,
            to_hash.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.hash_workers));
        let mut handles = Vec::with_capacity(to_hash.len());

        for file in to_hash {
            if self.is_cancelled() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let hasher = self.hasher.clone();
            let cache = cache.clone();

            handles.push(tokio::spawn(async move {
                let result = hasher.hash_file(&file.abs).await;
                if let (Ok(hash), Some(cache)) = (&result, &cache) {
                    cache.record(&file.rel, file.mtime_ns, file.size, hash).await;
                }
                drop(permit);
                (file, result)
            }));
        }

        let mut hashed = 0usize;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((file, Ok(hash))) => {
                    hashed += 1;
                    files.insert(file.rel.clone(), file.into_detail(hash));
                }
                Ok((file, Err(e))) => {
                    warn!("计算哈希失败，跳过 {}: {}", file.rel, e);
                    errors.push(e.to_string());
                }
                Err(e) => {
                    warn!("哈希任务失败: {}", e);
                    errors.push(e.to_string());
                }
            }
        }

        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        info!(
            "详情扫描完成: {} 个文件 (计算 {}, 缓存 {}, 失败 {}): {:?}",
            files.len(),
            hashed,
            cached,
            errors.len(),
            root
        );

        Ok(DetailScan {
            files,
            errors,
            hashed,
            cached,
        })
    }
}

/// 自顶向下遍历；命中排除规则的目录既不枚举也不深入
fn walk_paths(root: &Path, base: &Path, filter: &ExclusionFilter) -> PathScan {
    let mut scan = PathScan::default();
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                warn!("遍历目录出错: {}", e);
                scan.errors.push(e.to_string());
                continue;
            }
        };

        let Some(rel) = relative_path(entry.path(), base) else {
            continue;
        };

        if is_dir_like(&entry) {
            if entry.depth() > 0 && filter.is_excluded(&rel) {
                debug!("排除目录: {}", rel);
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if !rel.is_empty() {
                scan.dirs.insert(rel);
            }
        } else {
            scan.files.insert(rel);
        }
    }

    scan
}

/// 目录，或指向目录的符号链接（不跟随进入）
fn is_dir_like(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir())
}

/// 元数据阶段：只收集大小和修改时间
fn walk_metadata(
    root: &Path,
    base: &Path,
    filter: &ExclusionFilter,
) -> (Vec<PendingFile>, Vec<String>) {
    let mut pending = Vec::new();
    let mut errors = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                warn!("遍历目录出错: {}", e);
                errors.push(e.to_string());
                continue;
            }
        };

        let Some(rel) = relative_path(entry.path(), base) else {
            continue;
        };

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && filter.is_excluded(&rel) {
                debug!("排除目录: {}", rel);
                walker.skip_current_dir();
            }
            continue;
        }
        if is_dir_like(&entry) {
            debug!("跳过目录链接: {}", rel);
            continue;
        }

        let meta = std::fs::metadata(entry.path()).and_then(|m| mtime_ns(&m).map(|t| (m.len(), t)));
        match meta {
            Ok((size, mtime_ns)) => pending.push(PendingFile {
                rel,
                abs: entry.path().to_path_buf(),
                size,
                mtime_ns,
            }),
            Err(e) => {
                let err = SyncError::io("读取元数据", entry.path(), e);
                warn!("{}", err);
                errors.push(err.to_string());
            }
        }
    }

    (pending, errors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// 统计实际读取次数的哈希器
    #[derive(Default)]
    pub(crate) struct CountingHasher {
        pub reads: AtomicUsize,
    }

    #[async_trait]
    impl ContentHasher for CountingHasher {
        async fn hash_file(&self, path: &Path) -> SyncResult<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Blake3Hasher.hash_file(path).await
        }
    }

    /// 对指定文件名返回读取错误的哈希器
    struct FailingHasher(&'static str);

    #[async_trait]
    impl ContentHasher for FailingHasher {
        async fn hash_file(&self, path: &Path) -> SyncResult<String> {
            if path.file_name().and_then(|n| n.to_str()) == Some(self.0) {
                return Err(SyncError::io(
                    "读取文件",
                    path,
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                ));
            }
            Blake3Hasher.hash_file(path).await
        }
    }

    pub(crate) fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = join_relative(root, rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_scan_paths_has_unique_files_and_closed_dir_chain() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "top.txt", b"1");
        write(root, "a/one.txt", b"2");
        write(root, "a/b/two.txt", b"3");
        write(root, "a/b/c/three.txt", b"4");
        std::fs::create_dir_all(root.join("empty/inner")).unwrap();

        let scan = TreeScanner::new(ExclusionFilter::default())
            .scan_paths(root, root)
            .await
            .unwrap();

        let files: Vec<_> = scan.files.iter().cloned().collect();
        assert_eq!(
            files,
            vec!["a/b/c/three.txt", "a/b/two.txt", "a/one.txt", "top.txt"]
        );

        for file in &scan.files {
            let mut parts: Vec<&str> = file.split('/').collect();
            parts.pop();
            let mut prefix = String::new();
            for part in parts {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(part);
                assert!(scan.dirs.contains(&prefix), "缺少目录 {}", prefix);
            }
        }
        assert!(scan.dirs.contains("empty/inner"));
        assert!(!scan.dirs.contains(""));
    }

    #[tokio::test]
    async fn test_excluded_directory_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "keep/file.txt", b"k");
        write(root, "node_modules/pkg/index.js", b"x");
        write(root, "node_modules/pkg/deep/nested/more.js", b"y");
        write(root, "src/node_modules_cache/z.txt", b"z");

        let scanner = TreeScanner::new(ExclusionFilter::new(["node_modules"]));
        let paths = scanner.scan_paths(root, root).await.unwrap();
        assert!(paths.files.iter().all(|f| !f.contains("node_modules")));
        assert!(paths.dirs.iter().all(|d| !d.contains("node_modules")));
        assert!(paths.files.contains("keep/file.txt"));
        assert!(paths.dirs.contains("src"));

        let details = scanner.scan_details(root, root, None).await.unwrap();
        assert_eq!(details.files.len(), 1);
        assert!(details.files.contains_key("keep/file.txt"));
    }

    #[tokio::test]
    async fn test_scan_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(base, "sub/x/y.txt", b"y");

        let scan = TreeScanner::new(ExclusionFilter::default())
            .scan_paths(&base.join("sub"), base)
            .await
            .unwrap();

        assert!(scan.files.contains("sub/x/y.txt"));
        assert!(scan.dirs.contains("sub"));
        assert!(scan.dirs.contains("sub/x"));
    }

    #[tokio::test]
    async fn test_scan_details_fills_metadata_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "docs/readme.txt", b"hello world");

        let scan = TreeScanner::new(ExclusionFilter::default())
            .scan_details(root, root, None)
            .await
            .unwrap();

        let detail = &scan.files["docs/readme.txt"];
        assert_eq!(detail.size, 11);
        assert_eq!(detail.absolute_path, root.join("docs").join("readme.txt"));
        assert_eq!(
            detail.content_hash.as_deref(),
            Some(blake3::hash(b"hello world").to_hex().as_str())
        );
        assert_eq!(scan.total_size(), 11);
        assert_eq!(scan.hashed, 1);
    }

    #[tokio::test]
    async fn test_unchanged_files_are_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.txt", b"aaa");
        write(root, "b/c.txt", b"ccc");

        let hasher = Arc::new(CountingHasher::default());
        let scanner = TreeScanner::new(ExclusionFilter::default())
            .with_hasher(hasher.clone())
            .with_hash_workers(4);

        let cache = Arc::new(FingerprintCache::load(cache_dir.path(), root));
        let first = scanner.scan_details(root, root, Some(cache.clone())).await.unwrap();
        cache.save().await.unwrap();
        assert_eq!(first.hashed, 2);
        assert_eq!(hasher.reads.load(Ordering::SeqCst), 2);

        let cache = Arc::new(FingerprintCache::load(cache_dir.path(), root));
        let second = scanner.scan_details(root, root, Some(cache.clone())).await.unwrap();
        assert_eq!(hasher.reads.load(Ordering::SeqCst), 2);
        assert_eq!(second.cached, 2);
        assert_eq!(first.files, second.files);

        // 大小变化后缓存失效
        write(root, "a.txt", b"aaaa");
        let third = scanner.scan_details(root, root, Some(cache)).await.unwrap();
        assert_eq!(hasher.reads.load(Ordering::SeqCst), 3);
        assert_eq!(third.hashed, 1);
        assert_ne!(
            third.files["a.txt"].content_hash,
            first.files["a.txt"].content_hash
        );
    }

    #[tokio::test]
    async fn test_unreadable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "good.txt", b"ok");
        write(root, "bad.txt", b"nope");
        write(root, "more/good2.txt", b"ok2");

        let scan = TreeScanner::new(ExclusionFilter::default())
            .with_hasher(Arc::new(FailingHasher("bad.txt")))
            .scan_details(root, root, None)
            .await
            .unwrap();

        assert_eq!(scan.files.len(), 2);
        assert!(!scan.files.contains_key("bad.txt"));
        assert_eq!(scan.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"a");
        let flag = Arc::new(AtomicBool::new(true));

        let result = TreeScanner::new(ExclusionFilter::default())
            .with_cancel(flag)
            .scan_details(dir.path(), dir.path(), None)
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_symlink_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "real/inner.txt", b"inner");
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let scanner = TreeScanner::new(ExclusionFilter::default());
        let paths = scanner.scan_paths(root, root).await.unwrap();
        let details = scanner.scan_details(root, root, None).await.unwrap();

        assert!(paths.dirs.contains("link"));
        assert!(!paths.files.contains("link"));
        assert!(!paths.files.contains("link/inner.txt"));
        assert!(paths.errors.is_empty());
        assert!(!details.files.contains_key("link"));
        assert!(details.files.contains_key("real/inner.txt"));
        assert!(details.errors.is_empty());
    }

    #[test]
    fn test_duration_to_ns_saturates() {
        assert_eq!(duration_to_ns(Duration::from_nanos(1_500)), 1_500);
        assert_eq!(duration_to_ns(Duration::from_secs(u64::MAX / 2)), i64::MAX);
        assert_eq!(duration_to_ns(Duration::from_secs(u64::MAX / 2)).saturating_neg(), -i64::MAX);
    }

    #[test]
    fn test_join_relative_round_trip() {
        let root = Path::new("/base");
        let joined = join_relative(root, "a/b/c.txt");
        assert_eq!(relative_path(&joined, root).as_deref(), Some("a/b/c.txt"));
    }
}
