//! 确认接口：破坏性或批量操作执行前由外部决定是否继续

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 恢复模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// 只恢复缺失文件
    Safe,
    /// 恢复缺失和被修改的文件
    Force,
}

impl std::fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreMode::Safe => write!(f, "safe"),
            RestoreMode::Force => write!(f, "force"),
        }
    }
}

impl std::str::FromStr for RestoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1" | "safe" => Ok(RestoreMode::Safe),
            "2" | "force" => Ok(RestoreMode::Force),
            other => Err(format!("未知的恢复模式: {}", other)),
        }
    }
}

/// 被修改文件的展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedFile {
    pub path: String,
    pub source_mtime_ns: i64,
    pub backup_mtime_ns: i64,
}

/// 恢复计划，交给确认方展示
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub missing_files: Vec<String>,
    pub modified_files: Vec<ModifiedFile>,
    /// 已按浅到深排序
    pub missing_dirs: Vec<String>,
}

impl RestorePlan {
    pub fn is_empty(&self) -> bool {
        self.missing_files.is_empty() && self.modified_files.is_empty() && self.missing_dirs.is_empty()
    }
}

/// 确认方
///
/// 调用方会阻塞等待结果，但只影响下一阶段，不会打断已在执行的 I/O。
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// 展示一组路径并询问是否继续
    async fn confirm(&self, category: &str, items: &[String]) -> bool;

    /// 选择恢复模式，返回 None 表示取消
    async fn choose_restore_mode(&self, plan: &RestorePlan) -> Option<RestoreMode>;

    /// 覆盖前是否为即将被覆盖的文件做快照
    async fn confirm_snapshot(&self, files: &[String]) -> bool;
}

/// 固定应答，用于无人值守运行
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm {
    pub accept: bool,
    pub restore_mode: RestoreMode,
    pub snapshot: bool,
}

impl AutoConfirm {
    /// 全部同意
    pub fn yes(restore_mode: RestoreMode) -> Self {
        Self {
            accept: true,
            restore_mode,
            snapshot: true,
        }
    }

    /// 全部拒绝
    pub fn no() -> Self {
        Self {
            accept: false,
            restore_mode: RestoreMode::Safe,
            snapshot: false,
        }
    }
}

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, category: &str, items: &[String]) -> bool {
        tracing::debug!("自动确认 {} ({} 项): {}", category, items.len(), self.accept);
        self.accept
    }

    async fn choose_restore_mode(&self, _plan: &RestorePlan) -> Option<RestoreMode> {
        self.accept.then_some(self.restore_mode)
    }

    async fn confirm_snapshot(&self, _files: &[String]) -> bool {
        self.snapshot
    }
}
