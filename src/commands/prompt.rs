//! 终端交互确认

use crate::core::confirm::{Confirmer, RestoreMode, RestorePlan};
use async_trait::async_trait;
use std::io::{self, BufRead, Write};

/// 列表默认最多展示的条目数
const DEFAULT_PAGE_SIZE: usize = 20;

/// 在终端展示待处理项目并读取操作者的回答
#[derive(Debug, Clone)]
pub struct TerminalConfirmer {
    page_size: usize,
    restore_mode: Option<RestoreMode>,
}

impl Default for TerminalConfirmer {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            restore_mode: None,
        }
    }
}

impl TerminalConfirmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先指定恢复模式，不再询问
    pub fn with_restore_mode(mut self, mode: Option<RestoreMode>) -> Self {
        self.restore_mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// 打印提示并在阻塞线程中读取一行；stdin 关闭或出错时返回 None
async fn ask(prompt: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{}", prompt);
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "是")
}

/// 生成项目列表，超过 `limit` 条时折叠
pub fn format_listing(category: &str, items: &[String], limit: usize) -> String {
    let mut out = format!("{} ({} 项):\n", category, items.len());
    for item in items.iter().take(limit) {
        out.push_str("  ");
        out.push_str(item);
        out.push('\n');
    }
    if items.len() > limit {
        out.push_str(&format!("  ... 还有 {} 项\n", items.len() - limit));
    }
    out
}

fn format_mtime(mtime_ns: i64) -> String {
    chrono::DateTime::from_timestamp_nanos(mtime_ns)
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// 生成恢复计划摘要
pub fn format_plan(plan: &RestorePlan, limit: usize) -> String {
    let mut out = String::new();
    if !plan.missing_files.is_empty() {
        out.push_str(&format_listing("源中缺失的文件", &plan.missing_files, limit));
    }
    if !plan.modified_files.is_empty() {
        out.push_str(&format!("内容不同的文件 ({} 项):\n", plan.modified_files.len()));
        for file in plan.modified_files.iter().take(limit) {
            out.push_str(&format!(
                "  {}  源: {}  备份: {}\n",
                file.path,
                format_mtime(file.source_mtime_ns),
                format_mtime(file.backup_mtime_ns)
            ));
        }
        if plan.modified_files.len() > limit {
            out.push_str(&format!("  ... 还有 {} 项\n", plan.modified_files.len() - limit));
        }
    }
    if !plan.missing_dirs.is_empty() {
        out.push_str(&format_listing("源中缺失的目录", &plan.missing_dirs, limit));
    }
    out
}

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, category: &str, items: &[String]) -> bool {
        let listing = format_listing(category, items, self.page_size);
        let prompt = format!("\n{}是否继续? [y/N] ", listing);
        ask(prompt).await.is_some_and(|a| is_yes(&a))
    }

    async fn choose_restore_mode(&self, plan: &RestorePlan) -> Option<RestoreMode> {
        eprint!("\n{}", format_plan(plan, self.page_size));
        if let Some(mode) = self.restore_mode {
            return Some(mode);
        }

        let prompt = "\n恢复模式:\n  1) safe  只恢复缺失文件\n  2) force 同时覆盖内容不同的文件\n其他输入取消: "
            .to_string();
        ask(prompt).await?.parse().ok()
    }

    async fn confirm_snapshot(&self, files: &[String]) -> bool {
        let prompt = format!(
            "\n将覆盖源中 {} 个现有文件，是否先创建快照? [y/N] ",
            files.len()
        );
        ask(prompt).await.is_some_and(|a| is_yes(&a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confirm::ModifiedFile;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
    }

    #[test]
    fn test_listing_folds_long_lists() {
        let items: Vec<String> = (0..5).map(|i| format!("f{}.txt", i)).collect();
        let out = format_listing("过期文件", &items, 2);
        assert!(out.starts_with("过期文件 (5 项):"));
        assert!(out.contains("f1.txt"));
        assert!(!out.contains("f2.txt"));
        assert!(out.contains("还有 3 项"));
    }

    #[test]
    fn test_plan_lists_each_category() {
        let plan = RestorePlan {
            missing_files: vec!["lost.txt".into()],
            modified_files: vec![ModifiedFile {
                path: "edited.txt".into(),
                source_mtime_ns: 0,
                backup_mtime_ns: 1_000_000_000,
            }],
            missing_dirs: vec!["empty".into()],
        };
        let out = format_plan(&plan, 10);
        assert!(out.contains("lost.txt"));
        assert!(out.contains("edited.txt"));
        assert!(out.contains("empty"));
    }

    #[tokio::test]
    async fn test_preset_mode_skips_question() {
        let confirmer = TerminalConfirmer::new().with_restore_mode(Some(RestoreMode::Force));
        let mode = confirmer.choose_restore_mode(&RestorePlan::default()).await;
        assert_eq!(mode, Some(RestoreMode::Force));
    }
}
