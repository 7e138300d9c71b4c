//! 命令行交互层：确认、报告输出和设置命令

pub mod log;
pub mod prompt;
pub mod report;

pub use prompt::TerminalConfirmer;
