//! 差异计算：纯内存比较，不做任何 I/O

use crate::core::scanner::FileDetail;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// 文件差异
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub only_in_a: BTreeSet<String>,
    pub only_in_b: BTreeSet<String>,
    /// 两边都有但内容哈希不同
    pub modified: BTreeSet<String>,
    pub identical: BTreeSet<String>,
}

impl FileDiff {
    /// A 与 B 完全一致
    pub fn is_synchronized(&self) -> bool {
        self.only_in_a.is_empty() && self.only_in_b.is_empty() && self.modified.is_empty()
    }
}

/// 目录差异（目录没有内容签名，只做集合相减）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirDiff {
    pub only_in_a: BTreeSet<String>,
    pub only_in_b: BTreeSet<String>,
}

/// 恢复候选类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreKind {
    /// 源中不存在
    Missing,
    /// 源中存在但内容不同
    Modified,
}

/// 比较两份文件详情
pub fn diff_files(a: &HashMap<String, FileDetail>, b: &HashMap<String, FileDetail>) -> FileDiff {
    let mut diff = FileDiff::default();

    for (path, a_detail) in a {
        match b.get(path) {
            None => {
                diff.only_in_a.insert(path.clone());
            }
            Some(b_detail) => {
                if same_content(a_detail, b_detail) {
                    diff.identical.insert(path.clone());
                } else {
                    diff.modified.insert(path.clone());
                }
            }
        }
    }

    diff.only_in_b = b.keys().filter(|k| !a.contains_key(*k)).cloned().collect();
    diff
}

/// 哈希都已知且相等才算相同
fn same_content(a: &FileDetail, b: &FileDetail) -> bool {
    matches!((&a.content_hash, &b.content_hash), (Some(x), Some(y)) if x == y)
}

/// 比较两组目录
pub fn diff_dirs(a: &BTreeSet<String>, b: &BTreeSet<String>) -> DirDiff {
    DirDiff {
        only_in_a: a.difference(b).cloned().collect(),
        only_in_b: b.difference(a).cloned().collect(),
    }
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// 按深度降序排列，删除时子目录先于父目录
pub fn deepest_first<'a, I>(dirs: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<String> = dirs.into_iter().cloned().collect();
    sorted.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| b.cmp(a)));
    sorted
}

/// 按深度升序排列，创建时父目录先于子目录
pub fn shallowest_first<'a, I>(dirs: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<String> = dirs.into_iter().cloned().collect();
    sorted.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
    sorted
}

/// 以备份为准，找出源中缺失或内容不同的文件；完全相同的文件不会出现
///
/// 是否缺失以源的路径集合为准：源中存在但没有详情（例如读取失败）的文件
/// 无法证明相同，归为 `Modified`。
pub fn restore_candidates(
    source: &HashMap<String, FileDetail>,
    source_paths: &BTreeSet<String>,
    backup: &HashMap<String, FileDetail>,
) -> BTreeMap<String, RestoreKind> {
    backup
        .iter()
        .filter_map(|(path, backup_detail)| {
            if !source_paths.contains(path) && !source.contains_key(path) {
                return Some((path.clone(), RestoreKind::Missing));
            }
            match source.get(path) {
                Some(src) if same_content(src, backup_detail) => None,
                _ => Some((path.clone(), RestoreKind::Modified)),
            }
        })
        .collect()
}

/// 一组文件的总字节数
pub fn sum_sizes<'a, I>(paths: I, files: &HashMap<String, FileDetail>) -> u64
where
    I: IntoIterator<Item = &'a String>,
{
    paths
        .into_iter()
        .filter_map(|p| files.get(p))
        .map(|f| f.size)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn detail(path: &str, hash: Option<&str>) -> (String, FileDetail) {
        (
            path.to_string(),
            FileDetail {
                relative_path: path.to_string(),
                absolute_path: PathBuf::from("/x").join(path),
                size: 1,
                mtime_ns: 0,
                content_hash: hash.map(str::to_string),
            },
        )
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_docs_scenario() {
        let source: HashMap<_, _> = [
            detail("docs/readme.txt", Some("H1")),
            detail("docs/old.txt", Some("H3")),
        ]
        .into_iter()
        .collect();
        let dest: HashMap<_, _> = [detail("docs/readme.txt", Some("H2"))].into_iter().collect();

        let diff = diff_files(&source, &dest);
        assert_eq!(diff.modified, set(&["docs/readme.txt"]));
        assert_eq!(diff.only_in_a, set(&["docs/old.txt"]));
        assert!(diff.only_in_b.is_empty());
        assert!(diff.identical.is_empty());
        assert!(!diff.is_synchronized());
    }

    #[test]
    fn test_categories_are_disjoint() {
        let a: HashMap<_, _> = [
            detail("same", Some("h")),
            detail("changed", Some("h1")),
            detail("left", Some("l")),
            detail("unknown", None),
        ]
        .into_iter()
        .collect();
        let b: HashMap<_, _> = [
            detail("same", Some("h")),
            detail("changed", Some("h2")),
            detail("right", Some("r")),
            detail("unknown", None),
        ]
        .into_iter()
        .collect();

        let diff = diff_files(&a, &b);
        assert_eq!(diff.identical, set(&["same"]));
        assert_eq!(diff.modified, set(&["changed", "unknown"]));
        assert_eq!(diff.only_in_a, set(&["left"]));
        assert_eq!(diff.only_in_b, set(&["right"]));
    }

    #[test]
    fn test_diff_dirs() {
        let diff = diff_dirs(&set(&["a", "a/b", "c"]), &set(&["a", "d"]));
        assert_eq!(diff.only_in_a, set(&["a/b", "c"]));
        assert_eq!(diff.only_in_b, set(&["d"]));
    }

    #[test]
    fn test_deepest_first_orders_children_before_parents() {
        let dirs = set(&["a/b", "a", "a/b/c", "z"]);
        let order = deepest_first(&dirs);

        let pos = |p: &str| order.iter().position(|d| d == p).unwrap();
        assert!(pos("a/b/c") < pos("a/b"));
        assert!(pos("a/b") < pos("a"));
        assert_eq!(order[0], "a/b/c");
    }

    #[test]
    fn test_shallowest_first_orders_parents_before_children() {
        let dirs = set(&["a/b/c", "a", "a/b"]);
        assert_eq!(shallowest_first(&dirs), vec!["a", "a/b", "a/b/c"]);
    }

    #[test]
    fn test_restore_candidates() {
        let source: HashMap<_, _> = [
            detail("same.txt", Some("s")),
            detail("edited.txt", Some("new")),
            detail("extra.txt", Some("e")),
        ]
        .into_iter()
        .collect();
        let backup: HashMap<_, _> = [
            detail("same.txt", Some("s")),
            detail("edited.txt", Some("old")),
            detail("lost.txt", Some("l")),
        ]
        .into_iter()
        .collect();

        let source_paths: BTreeSet<String> = source.keys().cloned().collect();
        let candidates = restore_candidates(&source, &source_paths, &backup);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates["lost.txt"], RestoreKind::Missing);
        assert_eq!(candidates["edited.txt"], RestoreKind::Modified);
        assert!(!candidates.contains_key("same.txt"));
        assert!(!candidates.contains_key("extra.txt"));
    }

    #[test]
    fn test_unreadable_source_file_is_not_missing() {
        let backup: HashMap<_, _> = [detail("locked.txt", Some("b")), detail("lost.txt", Some("l"))]
            .into_iter()
            .collect();
        // locked.txt 在源中存在，但没有详情
        let source_paths: BTreeSet<String> = ["locked.txt".to_string()].into_iter().collect();

        let candidates = restore_candidates(&HashMap::new(), &source_paths, &backup);
        assert_eq!(candidates["locked.txt"], RestoreKind::Modified);
        assert_eq!(candidates["lost.txt"], RestoreKind::Missing);
    }
}
