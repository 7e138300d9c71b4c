use crate::core::comparator::{
    deepest_first, diff_dirs, diff_files, restore_candidates, shallowest_first, sum_sizes,
    FileDiff, RestoreKind,
};
use crate::core::confirm::{Confirmer, ModifiedFile, RestoreMode, RestorePlan};
use crate::core::disk::available_space;
use crate::core::filter::ExclusionFilter;
use crate::core::fingerprint::{Blake3Hasher, ContentHasher, FingerprintCache};
use crate::core::retry::RetryPolicy;
use crate::core::scanner::{default_hash_workers, join_relative, mtime_ns, DetailScan, FileDetail, TreeScanner};
use crate::error::{SyncError, SyncResult};
use filetime::FileTime;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 恢复前快照目录名前缀
pub const SNAPSHOT_DIR_PREFIX: &str = "backup_before_restore_";

/// 同步配置，一次操作内不可变
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub filter: ExclusionFilter,
    /// 复制/删除的最大并发数
    pub max_workers: usize,
    /// 哈希计算的最大并发数
    pub hash_workers: usize,
    pub retry: RetryPolicy,
    /// 指纹缓存目录，None 表示不持久化
    pub cache_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            filter: ExclusionFilter::default(),
            max_workers: 8,
            hash_workers: default_hash_workers(),
            retry: RetryPolicy::default(),
            cache_dir: None,
        }
    }
}

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Copy,
    Clean,
    Restore,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Copy => write!(f, "同步"),
            Operation::Clean => write!(f, "清理"),
            Operation::Restore => write!(f, "恢复"),
        }
    }
}

/// 操作最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Completed,
    /// 没有需要处理的项目
    UpToDate,
    /// 至少一项失败
    Failed,
    Cancelled,
    /// 操作者拒绝继续
    Declined,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub operation: Operation,
    pub status: SyncStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub files_scanned: u64,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub files_deleted: u64,
    pub dirs_deleted: u64,
    pub dirs_created: u64,
    pub files_backed_up: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub restore_mode: Option<RestoreMode>,
    pub backup_dir: Option<PathBuf>,
    pub errors: Vec<String>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl SyncReport {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            status: SyncStatus::Completed,
            start_time: chrono::Utc::now().timestamp(),
            end_time: 0,
            duration_ms: 0,
            files_scanned: 0,
            files_copied: 0,
            files_skipped: 0,
            files_deleted: 0,
            dirs_deleted: 0,
            dirs_created: 0,
            files_backed_up: 0,
            failed: 0,
            bytes_transferred: 0,
            restore_mode: None,
            backup_dir: None,
            errors: Vec::new(),
            started: Some(Instant::now()),
        }
    }

    fn finish(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self.end_time = chrono::Utc::now().timestamp();
        self.duration_ms = self
            .started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or_default();
        self
    }
}

/// 差异报告（只读比较）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferenceReport {
    pub only_in_source: Vec<String>,
    pub only_in_destination: Vec<String>,
    pub modified: Vec<String>,
    pub identical: u64,
    pub source_size: u64,
    pub destination_size: u64,
    pub only_in_source_bytes: u64,
    pub only_in_destination_bytes: u64,
    /// 被修改文件在源与目标之间的大小差（源 - 目标）
    pub modified_size_delta: i64,
    pub errors: Vec<String>,
}

impl DifferenceReport {
    fn build(source: &DetailScan, dest: &DetailScan, diff: FileDiff) -> Self {
        let modified_src = sum_sizes(&diff.modified, &source.files) as i64;
        let modified_dst = sum_sizes(&diff.modified, &dest.files) as i64;

        Self {
            only_in_source_bytes: sum_sizes(&diff.only_in_a, &source.files),
            only_in_destination_bytes: sum_sizes(&diff.only_in_b, &dest.files),
            modified_size_delta: modified_src - modified_dst,
            identical: diff.identical.len() as u64,
            only_in_source: diff.only_in_a.into_iter().collect(),
            only_in_destination: diff.only_in_b.into_iter().collect(),
            modified: diff.modified.into_iter().collect(),
            source_size: source.total_size(),
            destination_size: dest.total_size(),
            errors: source.errors.iter().chain(&dest.errors).cloned().collect(),
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.only_in_source.is_empty() && self.only_in_destination.is_empty() && self.modified.is_empty()
    }
}

/// 进度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: String,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
}

impl SyncProgress {
    pub fn is_done(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// 并发任务共享的进度计数
#[derive(Debug, Default)]
pub struct ProgressCounter {
    total: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

impl ProgressCounter {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn complete(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn fail(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, phase: &str) -> SyncProgress {
        SyncProgress {
            phase: phase.to_string(),
            total: self.total,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// 单文件任务动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Copy,
    Delete,
    RestoreCopy,
}

/// 单文件任务
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub rel_path: String,
    pub source_path: PathBuf,
    /// 复制的目标位置；删除时为被删除的文件
    pub destination_path: PathBuf,
    pub size: u64,
    pub action: TaskAction,
}

impl SyncTask {
    fn copy(detail: &FileDetail, destination_path: PathBuf) -> Self {
        Self {
            rel_path: detail.relative_path.clone(),
            source_path: detail.absolute_path.clone(),
            destination_path,
            size: detail.size,
            action: TaskAction::Copy,
        }
    }

    fn restore(backup: &FileDetail, source_path: PathBuf) -> Self {
        Self {
            rel_path: backup.relative_path.clone(),
            source_path: backup.absolute_path.clone(),
            destination_path: source_path,
            size: backup.size,
            action: TaskAction::RestoreCopy,
        }
    }

    fn delete(rel_path: &str, path: PathBuf) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            source_path: path.clone(),
            destination_path: path,
            size: 0,
            action: TaskAction::Delete,
        }
    }
}

/// 一批任务的执行结果
#[derive(Debug, Default)]
struct PoolOutcome {
    succeeded: Vec<SyncTask>,
    errors: Vec<String>,
    bytes: u64,
    not_started: usize,
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    confirmer: Arc<dyn Confirmer>,
    hasher: Arc<dyn ContentHasher>,
    cancelled: Arc<AtomicBool>,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
    /// 查询目标卷可用空间
    free_space: fn(&Path) -> Option<u64>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, confirmer: Arc<dyn Confirmer>) -> Self {
        Self {
            config,
            confirmer,
            hasher: Arc::new(Blake3Hasher),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress_tx: None,
            free_space: available_space,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_free_space(mut self, query: fn(&Path) -> Option<u64>) -> Self {
        self.free_space = query;
        self
    }

    /// 设置进度通道
    pub fn with_progress(mut self, tx: mpsc::Sender<SyncProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 取消操作：不再派发新任务，已在执行的任务自然结束
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn scanner(&self) -> TreeScanner {
        TreeScanner::new(self.config.filter.clone())
            .with_hasher(self.hasher.clone())
            .with_hash_workers(self.config.hash_workers)
            .with_cancel(self.cancelled.clone())
    }

    fn load_cache(&self, root: &Path) -> Option<Arc<FingerprintCache>> {
        self.config
            .cache_dir
            .as_ref()
            .map(|dir| Arc::new(FingerprintCache::load(dir, root)))
    }

    async fn save_cache(&self, cache: Option<&Arc<FingerprintCache>>) {
        if let Some(cache) = cache {
            if let Err(e) = cache.save().await {
                warn!("{}", e);
            }
        }
    }

    fn require_dir(path: &Path) -> SyncResult<()> {
        if path.is_dir() {
            Ok(())
        } else {
            Err(SyncError::MissingRoot(path.to_path_buf()))
        }
    }

    /// 镜像同步：先复制，再清理目标中的过期项目
    pub async fn mirror(&self) -> SyncResult<Vec<SyncReport>> {
        let copy = self.copy_sync().await?;
        if copy.status == SyncStatus::Cancelled {
            return Ok(vec![copy]);
        }
        let clean = self.remove_obsolete().await?;
        Ok(vec![copy, clean])
    }

    /// 把源目录同步到目标目录
    pub async fn copy_sync(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::new(Operation::Copy);
        let result = self.copy_sync_into(&mut report).await;
        conclude(report, result)
    }

    async fn copy_sync_into(&self, report: &mut SyncReport) -> SyncResult<SyncStatus> {
        let src = &self.config.source;
        let dst = &self.config.destination;

        Self::require_dir(src)?;
        tokio::fs::create_dir_all(dst)
            .await
            .map_err(|e| SyncError::io("创建目录", dst, e))?;

        info!("开始同步: {:?} -> {:?}", src, dst);

        let scanner = self.scanner();
        let src_cache = self.load_cache(src);
        let dst_cache = self.load_cache(dst);
        let source = scanner.scan_details(src, src, src_cache.clone()).await?;
        let dest = scanner.scan_details(dst, dst, dst_cache.clone()).await?;

        report.files_scanned = (source.files.len() + dest.files.len()) as u64;
        report.errors.extend(source.errors.iter().chain(&dest.errors).cloned());
        report.failed += report.errors.len() as u64;

        let diff = diff_files(&source.files, &dest.files);
        report.files_skipped = diff.identical.len() as u64;

        let tasks: Vec<SyncTask> = diff
            .only_in_a
            .iter()
            .chain(&diff.modified)
            .filter_map(|rel| source.files.get(rel))
            .map(|detail| SyncTask::copy(detail, join_relative(dst, &detail.relative_path)))
            .collect();

        debug!(
            "比较完成: {} 个新增, {} 个修改, {} 个相同",
            diff.only_in_a.len(),
            diff.modified.len(),
            diff.identical.len()
        );

        if tasks.is_empty() {
            self.save_cache(src_cache.as_ref()).await;
            self.save_cache(dst_cache.as_ref()).await;
            info!("目标已是最新");
            return Ok(if report.failed == 0 {
                SyncStatus::UpToDate
            } else {
                SyncStatus::Failed
            });
        }

        let needed: u64 = tasks.iter().map(|t| t.size).sum();
        ensure_capacity(needed, (self.free_space)(dst))?;
        info!("需要同步 {} 个文件 ({} 字节)", tasks.len(), needed);

        let outcome = self.run_pool("复制文件", tasks).await;

        if let Some(cache) = &dst_cache {
            for task in &outcome.succeeded {
                let Some(hash) = source
                    .files
                    .get(&task.rel_path)
                    .and_then(|d| d.content_hash.as_deref())
                else {
                    continue;
                };
                match std::fs::metadata(&task.destination_path)
                    .and_then(|m| mtime_ns(&m).map(|t| (t, m.len())))
                {
                    Ok((mtime, size)) => cache.record(&task.rel_path, mtime, size, hash).await,
                    Err(e) => debug!("读取目标元数据失败 {}: {}", task.rel_path, e),
                }
            }
        }
        self.save_cache(src_cache.as_ref()).await;
        self.save_cache(dst_cache.as_ref()).await;

        report.files_copied = outcome.succeeded.len() as u64;
        report.bytes_transferred = outcome.bytes;
        report.failed += outcome.errors.len() as u64;

        info!(
            "同步完成: 复制 {}, 跳过 {}, 失败 {}",
            report.files_copied, report.files_skipped, report.failed
        );

        Ok(self.status_after(report, outcome))
    }

    /// 删除目标中源已不存在的文件和目录，执行前必须得到确认
    pub async fn remove_obsolete(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::new(Operation::Clean);
        let result = self.remove_obsolete_into(&mut report).await;
        conclude(report, result)
    }

    async fn remove_obsolete_into(&self, report: &mut SyncReport) -> SyncResult<SyncStatus> {
        let src = &self.config.source;
        let dst = &self.config.destination;
        Self::require_dir(src)?;
        Self::require_dir(dst)?;

        let scanner = self.scanner();
        let source = scanner.scan_paths(src, src).await?;
        let dest = scanner.scan_paths(dst, dst).await?;
        report.files_scanned = (source.files.len() + dest.files.len()) as u64;
        report.errors.extend(source.errors.iter().chain(&dest.errors).cloned());
        report.failed += report.errors.len() as u64;

        let obsolete_files: Vec<String> = dest.files.difference(&source.files).cloned().collect();
        let obsolete_dirs = deepest_first(&diff_dirs(&source.dirs, &dest.dirs).only_in_b);

        if obsolete_files.is_empty() && obsolete_dirs.is_empty() {
            info!("目标已与源一致，没有过期项目");
            return Ok(SyncStatus::UpToDate);
        }

        let mut declined = false;
        let mut outcome = PoolOutcome::default();

        if !obsolete_files.is_empty() {
            if self.confirmer.confirm("过期文件", &obsolete_files).await {
                let tasks = obsolete_files
                    .iter()
                    .map(|rel| SyncTask::delete(rel, join_relative(dst, rel)))
                    .collect();
                outcome = self.run_pool("删除过期文件", tasks).await;
                report.files_deleted = outcome.succeeded.len() as u64;
                report.failed += outcome.errors.len() as u64;
            } else {
                info!("已取消删除 {} 个过期文件", obsolete_files.len());
                declined = true;
            }
        }

        // 文件被拒绝删除或删除失败时，保留仍包含这些文件的目录
        let deleted: HashSet<&str> = outcome.succeeded.iter().map(|t| t.rel_path.as_str()).collect();
        let remaining: Vec<&String> = obsolete_files
            .iter()
            .filter(|rel| !deleted.contains(rel.as_str()))
            .collect();
        let (obsolete_dirs, kept): (Vec<String>, Vec<String>) = obsolete_dirs
            .into_iter()
            .partition(|dir| !contains_any(dir, &remaining));
        if !kept.is_empty() {
            info!("{} 个过期目录仍包含未删除的文件，已保留", kept.len());
        }

        if !obsolete_dirs.is_empty() && !self.is_cancelled() {
            if self.confirmer.confirm("过期目录", &obsolete_dirs).await {
                for (i, rel) in obsolete_dirs.iter().enumerate() {
                    if self.is_cancelled() {
                        outcome.not_started += obsolete_dirs.len() - i;
                        break;
                    }
                    let path = join_relative(dst, rel);
                    let label = format!("删除目录 {}", rel);
                    match self.config.retry.run(&label, || remove_dir(&path)).await {
                        Ok(()) => {
                            debug!("已删除目录: {}", rel);
                            report.dirs_deleted += 1;
                        }
                        Err(e) => {
                            report.failed += 1;
                            outcome.errors.push(e.to_string());
                        }
                    }
                }
            } else {
                info!("已取消删除 {} 个过期目录", obsolete_dirs.len());
                declined = true;
            }
        }

        info!(
            "清理完成: 删除文件 {}, 删除目录 {}, 失败 {}",
            report.files_deleted, report.dirs_deleted, report.failed
        );

        if declined && report.files_deleted == 0 && report.dirs_deleted == 0 && outcome.errors.is_empty() {
            return Ok(SyncStatus::Declined);
        }
        Ok(self.status_after(report, outcome))
    }

    /// 以目标目录为备份，修复源目录
    pub async fn restore(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::new(Operation::Restore);
        let result = self.restore_into(&mut report).await;
        conclude(report, result)
    }

    async fn restore_into(&self, report: &mut SyncReport) -> SyncResult<SyncStatus> {
        let src = &self.config.source;
        let backup = &self.config.destination;

        Self::require_dir(backup)?;
        tokio::fs::create_dir_all(src)
            .await
            .map_err(|e| SyncError::io("创建目录", src, e))?;

        info!("开始恢复: {:?} -> {:?}", backup, src);

        let scanner = self.scanner();
        let src_cache = self.load_cache(src);
        let backup_cache = self.load_cache(backup);
        let source = scanner.scan_details(src, src, src_cache.clone()).await?;
        let saved = scanner.scan_details(backup, backup, backup_cache.clone()).await?;
        self.save_cache(backup_cache.as_ref()).await;

        report.files_scanned = (source.files.len() + saved.files.len()) as u64;
        report.errors.extend(source.errors.iter().chain(&saved.errors).cloned());
        report.failed += report.errors.len() as u64;

        let result = self.apply_restore(report, &source, &saved, src_cache.as_deref()).await;
        self.save_cache(src_cache.as_ref()).await;
        result
    }

    async fn apply_restore(
        &self,
        report: &mut SyncReport,
        source: &DetailScan,
        saved: &DetailScan,
        src_cache: Option<&FingerprintCache>,
    ) -> SyncResult<SyncStatus> {
        let src = &self.config.source;
        let backup = &self.config.destination;

        let scanner = self.scanner();
        let src_paths = scanner.scan_paths(src, src).await?;
        let backup_dirs = scanner.scan_paths(backup, backup).await?.dirs;
        let missing_dirs = shallowest_first(&diff_dirs(&src_paths.dirs, &backup_dirs).only_in_b);

        // 源中存在但未能计算哈希的文件按“内容不同”处理，只有 Force 会覆盖
        let candidates = restore_candidates(&source.files, &src_paths.files, &saved.files);

        let mut plan = RestorePlan {
            missing_dirs,
            ..Default::default()
        };
        for (path, kind) in &candidates {
            match kind {
                RestoreKind::Missing => plan.missing_files.push(path.clone()),
                RestoreKind::Modified => plan.modified_files.push(ModifiedFile {
                    path: path.clone(),
                    source_mtime_ns: source.files.get(path).map(|d| d.mtime_ns).unwrap_or_default(),
                    backup_mtime_ns: saved.files.get(path).map(|d| d.mtime_ns).unwrap_or_default(),
                }),
            }
        }

        if plan.is_empty() {
            info!("源与备份一致，没有需要恢复的项目");
            return Ok(SyncStatus::UpToDate);
        }

        let Some(mode) = self.confirmer.choose_restore_mode(&plan).await else {
            info!("已取消恢复");
            return Ok(SyncStatus::Declined);
        };
        report.restore_mode = Some(mode);

        let selected: Vec<(&String, RestoreKind)> = candidates
            .iter()
            .filter(|(_, kind)| mode == RestoreMode::Force || **kind == RestoreKind::Missing)
            .map(|(path, kind)| (path, *kind))
            .collect();
        let to_restore: Vec<&String> = selected.iter().map(|(path, _)| *path).collect();

        if to_restore.is_empty() && plan.missing_dirs.is_empty() {
            info!("{} 模式下没有需要恢复的项目", mode);
            return Ok(SyncStatus::UpToDate);
        }

        let listing: Vec<String> = to_restore
            .iter()
            .map(|p| p.to_string())
            .chain(plan.missing_dirs.iter().map(|d| format!("{}/", d)))
            .collect();
        if !self.confirmer.confirm("待恢复项目", &listing).await {
            info!("已取消恢复");
            return Ok(SyncStatus::Declined);
        }

        // 即将被覆盖的文件
        let overwritten: Vec<String> = selected
            .iter()
            .filter(|(_, kind)| *kind == RestoreKind::Modified)
            .map(|(path, _)| path.to_string())
            .collect();
        if !overwritten.is_empty() && self.confirmer.confirm_snapshot(&overwritten).await {
            let snapshot = snapshot_files(src, &overwritten).await;
            report.files_backed_up = snapshot.copied;
            report.errors.extend(snapshot.errors);
            report.backup_dir = Some(snapshot.dir);
        }

        let mut dir_errors = Vec::new();
        for rel in &plan.missing_dirs {
            if self.is_cancelled() {
                break;
            }
            let path = join_relative(src, rel);
            match tokio::fs::create_dir_all(&path).await {
                Ok(()) => {
                    debug!("已恢复目录: {}", rel);
                    report.dirs_created += 1;
                }
                Err(e) => {
                    let err = SyncError::io("创建目录", &path, e);
                    warn!("{}", err);
                    dir_errors.push(err.to_string());
                }
            }
        }
        report.failed += dir_errors.len() as u64;

        let tasks = to_restore
            .iter()
            .filter_map(|rel| saved.files.get(rel.as_str()))
            .map(|detail| SyncTask::restore(detail, join_relative(src, &detail.relative_path)))
            .collect();
        let mut outcome = self.run_pool("恢复文件", tasks).await;
        report.failed += outcome.errors.len() as u64;
        outcome.errors.extend(dir_errors);

        if let Some(cache) = src_cache {
            for task in &outcome.succeeded {
                let Some(hash) = saved
                    .files
                    .get(&task.rel_path)
                    .and_then(|d| d.content_hash.as_deref())
                else {
                    continue;
                };
                if let Ok((mtime, size)) = std::fs::metadata(&task.destination_path)
                    .and_then(|m| mtime_ns(&m).map(|t| (t, m.len())))
                {
                    cache.record(&task.rel_path, mtime, size, hash).await;
                }
            }
        }

        report.files_copied = outcome.succeeded.len() as u64;
        report.bytes_transferred = outcome.bytes;

        info!(
            "恢复完成: {}/{} 个文件, {} 个目录",
            report.files_copied,
            to_restore.len(),
            report.dirs_created
        );

        Ok(self.status_after(report, outcome))
    }

    /// 只读比较两棵目录树
    pub async fn compare(&self) -> SyncResult<DifferenceReport> {
        let src = &self.config.source;
        let dst = &self.config.destination;
        Self::require_dir(src)?;
        Self::require_dir(dst)?;

        let scanner = self.scanner();
        let src_cache = self.load_cache(src);
        let dst_cache = self.load_cache(dst);
        let source = scanner.scan_details(src, src, src_cache.clone()).await?;
        let dest = scanner.scan_details(dst, dst, dst_cache.clone()).await?;
        self.save_cache(src_cache.as_ref()).await;
        self.save_cache(dst_cache.as_ref()).await;

        let diff = diff_files(&source.files, &dest.files);
        let report = DifferenceReport::build(&source, &dest, diff);

        info!(
            "差异分析完成: 仅源 {}, 仅目标 {}, 修改 {}, 相同 {}",
            report.only_in_source.len(),
            report.only_in_destination.len(),
            report.modified.len(),
            report.identical
        );
        Ok(report)
    }

    fn status_after(&self, report: &mut SyncReport, outcome: PoolOutcome) -> SyncStatus {
        report.errors.extend(outcome.errors);
        if outcome.not_started > 0 || self.is_cancelled() {
            SyncStatus::Cancelled
        } else if report.failed > 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        }
    }

    /// 在有界工作池中并发执行任务
    async fn run_pool(&self, phase: &str, tasks: Vec<SyncTask>) -> PoolOutcome {
        let progress = Arc::new(ProgressCounter::new(tasks.len() as u64));
        let _reporter = scopeguard::guard(
            self.spawn_progress_reporter(phase, progress.clone()),
            |handle| {
                if let Some(handle) = handle {
                    handle.abort();
                }
            },
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut outcome = PoolOutcome::default();
        let mut handles = Vec::with_capacity(tasks.len());
        let mut pending = tasks.into_iter();

        while let Some(task) = pending.next() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                outcome.not_started = 1 + pending.len();
                break;
            };
            if self.is_cancelled() {
                outcome.not_started = 1 + pending.len();
                info!("已取消，{} 个任务未执行", outcome.not_started);
                break;
            }

            let retry = self.config.retry;
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                let result = execute_task(&task, &retry).await;
                match &result {
                    Ok(bytes) => progress.complete(*bytes),
                    Err(_) => progress.fail(),
                }
                drop(permit);
                (task, result)
            }));
        }

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((task, Ok(bytes))) => {
                    debug!("完成: {}", task.rel_path);
                    outcome.bytes += bytes;
                    outcome.succeeded.push(task);
                }
                Ok((task, Err(e))) => {
                    warn!("{} 失败: {}", task.rel_path, e);
                    outcome.errors.push(e.to_string());
                }
                Err(e) => {
                    warn!("任务异常退出: {}", e);
                    outcome.errors.push(e.to_string());
                }
            }
        }

        self.send_progress(progress.snapshot(phase)).await;
        outcome
    }

    fn spawn_progress_reporter(
        &self,
        phase: &str,
        progress: Arc<ProgressCounter>,
    ) -> Option<JoinHandle<()>> {
        let tx = self.progress_tx.clone()?;
        let phase = phase.to_string();

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let snapshot = progress.snapshot(&phase);
                let done = snapshot.is_done();
                if tx.send(snapshot).await.is_err() || done {
                    break;
                }
            }
        }))
    }

    async fn send_progress(&self, progress: SyncProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(progress).await;
        }
    }
}

/// 把内部结果收尾为报告；取消不是错误
fn conclude(mut report: SyncReport, result: SyncResult<SyncStatus>) -> SyncResult<SyncReport> {
    match result {
        Ok(status) => Ok(report.finish(status)),
        Err(SyncError::Cancelled) => {
            report.errors.push(SyncError::Cancelled.to_string());
            Ok(report.finish(SyncStatus::Cancelled))
        }
        Err(e) => Err(e),
    }
}

/// `dir` 下是否有 `files` 中的路径
fn contains_any(dir: &str, files: &[&String]) -> bool {
    let prefix = format!("{}/", dir);
    files.iter().any(|f| f.starts_with(&prefix))
}

/// 空间预检（估算）
pub fn ensure_capacity(needed: u64, available: Option<u64>) -> SyncResult<()> {
    match available {
        Some(available) if available < needed => Err(SyncError::Space { needed, available }),
        _ => Ok(()),
    }
}

async fn execute_task(task: &SyncTask, retry: &RetryPolicy) -> SyncResult<u64> {
    match task.action {
        TaskAction::Copy | TaskAction::RestoreCopy => {
            let label = format!("复制 {}", task.rel_path);
            retry
                .run(&label, || copy_file(&task.source_path, &task.destination_path))
                .await
        }
        TaskAction::Delete => {
            let label = format!("删除 {}", task.rel_path);
            retry
                .run(&label, || remove_file(&task.destination_path))
                .await
                .map(|_| 0)
        }
    }
}

async fn copy_file(from: &Path, to: &Path) -> SyncResult<u64> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || copy_preserving_mtime(&from, &to)).await?
}

/// 复制文件并保留时间戳
///
/// 先写入同目录下的临时文件再重命名，目标位置不会出现写了一半的文件。
pub fn copy_preserving_mtime(from: &Path, to: &Path) -> SyncResult<u64> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::io("创建目录", parent, e))?;
    }

    let meta = std::fs::metadata(from).map_err(|e| SyncError::io("读取元数据", from, e))?;
    let tmp = temp_sibling(to);

    let result = std::fs::copy(from, &tmp)
        .map_err(|e| SyncError::io("复制文件", from, e))
        .and_then(|bytes| {
            filetime::set_file_times(
                &tmp,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )
            .map_err(|e| SyncError::io("设置时间戳", &tmp, e))?;
            std::fs::rename(&tmp, to).map_err(|e| SyncError::io("重命名", to, e))?;
            Ok(bytes)
        });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.synctree-tmp", name))
}

async fn remove_file(path: &Path) -> SyncResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io("删除文件", path, e)),
    }
}

async fn remove_dir(path: &Path) -> SyncResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io("删除目录", path, e)),
    }
}

struct Snapshot {
    dir: PathBuf,
    copied: u64,
    errors: Vec<String>,
}

/// 覆盖前把源中现有文件复制到带时间戳的快照目录；单个文件失败只记录
async fn snapshot_files(src: &Path, files: &[String]) -> Snapshot {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let dir = src.join(format!("{}{}", SNAPSHOT_DIR_PREFIX, stamp));
    info!("创建恢复前快照: {:?}", dir);

    let mut snapshot = Snapshot {
        dir,
        copied: 0,
        errors: Vec::new(),
    };

    for rel in files {
        let from = join_relative(src, rel);
        let to = join_relative(&snapshot.dir, rel);
        match copy_file(&from, &to).await {
            Ok(_) => snapshot.copied += 1,
            Err(e) => {
                warn!("快照失败，继续恢复: {}", e);
                snapshot.errors.push(format!("快照失败: {}", e));
            }
        }
    }

    snapshot
}
