use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use synctree_lib::commands::report::{format_difference, format_progress, format_report};
use synctree_lib::commands::TerminalConfirmer;
use synctree_lib::config::default_config_dir;
use synctree_lib::core::{AutoConfirm, Confirmer, RestoreMode, SyncProgress, SyncStatus};
use synctree_lib::logging::{log_dir, LogConfig, SizeRotatingWriter};
use synctree_lib::{SyncEngine, SyncReport, SyncSettings};
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 目录镜像、清理与恢复工具
#[derive(Debug, Parser)]
#[command(name = "synctree", version, about)]
struct Cli {
    /// 配置目录，默认 <用户配置目录>/synctree
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// 源目录
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// 目标（备份）目录
    #[arg(long = "dest", global = true)]
    destination: Option<PathBuf>,

    /// 追加排除的目录名片段，可重复
    #[arg(long, global = true)]
    exclude: Vec<String>,

    /// 复制/删除的并发数
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// 不读写指纹缓存
    #[arg(long, global = true)]
    no_cache: bool,

    /// 不询问，全部同意
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// 以 JSON 输出报告
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 复制新增和修改的文件，再清理目标中的过期项目
    Sync,
    /// 只复制新增和修改的文件
    Copy,
    /// 只清理目标中的过期项目
    Clean,
    /// 从目标（备份）恢复源目录
    Restore {
        /// safe 只恢复缺失文件，force 同时覆盖内容不同的文件
        #[arg(long)]
        mode: Option<RestoreMode>,
    },
    /// 只读比较两个目录
    Diff {
        /// 每类最多列出的路径数
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// 查看或保存当前生效的同步设置
    Config {
        #[arg(long)]
        save: bool,
    },
    /// 修改日志设置
    Log {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        max_size_mb: Option<u32>,
        #[arg(long)]
        level: Option<String>,
    },
}

/// 初始化日志系统
fn init_logging(config_dir: &Path) {
    let config = LogConfig::load(config_dir);

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file_layer = config
        .enabled
        .then(|| SizeRotatingWriter::new(&log_dir(config_dir), config.max_size_mb))
        .and_then(|writer| writer.inspect_err(|e| eprintln!("无法创建日志文件: {}", e)).ok())
        .map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
        });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn apply_overrides(settings: &mut SyncSettings, cli: &Cli) {
    if let Some(source) = &cli.source {
        settings.source_folder = Some(source.clone());
    }
    if let Some(destination) = &cli.destination {
        settings.destination_folder = Some(destination.clone());
    }
    settings.excluded_folders.extend(cli.exclude.iter().cloned());
    if let Some(workers) = cli.workers {
        settings.max_workers = workers;
    }
    if cli.no_cache {
        settings.cache_enabled = false;
    }
}

async fn print_progress(mut rx: mpsc::Receiver<SyncProgress>) {
    while let Some(progress) = rx.recv().await {
        eprintln!("{}", format_progress(&progress));
    }
}

fn print_reports(reports: &[SyncReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            print!("{}", format_report(report));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir)?;
    init_logging(&config_dir);

    let mut settings = SyncSettings::load(&config_dir);
    apply_overrides(&mut settings, &cli);

    let restore_mode = match &cli.command {
        Command::Log {
            enabled,
            max_size_mb,
            level,
        } => {
            let config = synctree_lib::commands::log::update_log_config(
                &config_dir,
                *enabled,
                *max_size_mb,
                level.clone(),
            )?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Command::Config { save } => {
            if *save {
                settings.save(&config_dir)?;
                tracing::info!("设置已保存到 {:?}", config_dir);
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        Command::Restore { mode } => *mode,
        _ => None,
    };

    let confirmer: Arc<dyn Confirmer> = if cli.yes {
        Arc::new(AutoConfirm::yes(restore_mode.unwrap_or(RestoreMode::Safe)))
    } else {
        Arc::new(TerminalConfirmer::new().with_restore_mode(restore_mode))
    };

    let (tx, rx) = mpsc::channel(32);
    let engine = SyncEngine::new(settings.to_config()?, confirmer).with_progress(tx);
    let printer = tokio::spawn(print_progress(rx));

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，等待进行中的任务结束...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let reports = match &cli.command {
        Command::Sync => engine.mirror().await?,
        Command::Copy => vec![engine.copy_sync().await?],
        Command::Clean => vec![engine.remove_obsolete().await?],
        Command::Restore { .. } => vec![engine.restore().await?],
        Command::Diff { limit } => {
            let report = engine.compare().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", format_difference(&report, *limit));
            }
            Vec::new()
        }
        Command::Config { .. } | Command::Log { .. } => Vec::new(),
    };

    drop(engine);
    let _ = printer.await;

    print_reports(&reports, cli.json)?;

    if reports.iter().any(|r| r.status == SyncStatus::Failed) {
        bail!("部分项目处理失败");
    }
    if reports.iter().any(|r| r.status == SyncStatus::Cancelled) {
        bail!("操作已取消");
    }
    Ok(())
}
