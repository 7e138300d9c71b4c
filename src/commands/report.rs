//! 报告和进度的终端输出

use crate::core::engine::{DifferenceReport, SyncProgress, SyncReport, SyncStatus};

/// 格式化字节数
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

pub fn format_status(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Completed => "完成",
        SyncStatus::UpToDate => "无需处理",
        SyncStatus::Failed => "部分失败",
        SyncStatus::Cancelled => "已取消",
        SyncStatus::Declined => "已放弃",
    }
}

pub fn format_progress(progress: &SyncProgress) -> String {
    format!(
        "[{}] {}/{} 失败 {} 已传输 {}",
        progress.phase,
        progress.completed,
        progress.total,
        progress.failed,
        format_size(progress.bytes_transferred)
    )
}

pub fn format_report(report: &SyncReport) -> String {
    let mut out = format!(
        "{}{} (耗时 {:.1}s)\n",
        report.operation,
        format_status(report.status),
        report.duration_ms as f64 / 1000.0
    );

    let counters = [
        ("扫描", report.files_scanned),
        ("复制", report.files_copied),
        ("跳过", report.files_skipped),
        ("删除文件", report.files_deleted),
        ("删除目录", report.dirs_deleted),
        ("创建目录", report.dirs_created),
        ("快照", report.files_backed_up),
        ("失败", report.failed),
    ];
    for (label, value) in counters.iter().filter(|(_, v)| *v > 0) {
        out.push_str(&format!("  {}: {}\n", label, value));
    }
    if report.bytes_transferred > 0 {
        out.push_str(&format!("  传输: {}\n", format_size(report.bytes_transferred)));
    }
    if let Some(mode) = report.restore_mode {
        out.push_str(&format!("  恢复模式: {}\n", mode));
    }
    if let Some(dir) = &report.backup_dir {
        out.push_str(&format!("  快照目录: {}\n", dir.display()));
    }
    for err in &report.errors {
        out.push_str(&format!("  错误: {}\n", err));
    }
    out
}

pub fn format_difference(report: &DifferenceReport, limit: usize) -> String {
    if report.is_synchronized() {
        return format!(
            "两个目录已同步 ({} 个相同文件, {})\n",
            report.identical,
            format_size(report.source_size)
        );
    }

    let mut out = format!(
        "源: {}  目标: {}  相同文件: {}\n",
        format_size(report.source_size),
        format_size(report.destination_size),
        report.identical
    );

    let sections = [
        ("仅在源中", &report.only_in_source, Some(report.only_in_source_bytes)),
        ("仅在目标中", &report.only_in_destination, Some(report.only_in_destination_bytes)),
        ("内容不同", &report.modified, None),
    ];
    for (label, paths, bytes) in sections {
        if paths.is_empty() {
            continue;
        }
        match bytes {
            Some(bytes) => out.push_str(&format!("{} ({} 项, {}):\n", label, paths.len(), format_size(bytes))),
            None => out.push_str(&format!(
                "{} ({} 项, 大小变化 {:+} B):\n",
                label,
                paths.len(),
                report.modified_size_delta
            )),
        }
        for path in paths.iter().take(limit) {
            out.push_str(&format!("  {}\n", path));
        }
        if paths.len() > limit {
            out.push_str(&format!("  ... 还有 {} 项\n", paths.len() - limit));
        }
    }
    for err in &report.errors {
        out.push_str(&format!("错误: {}\n", err));
    }
    out
}
