pub mod comparator;
pub mod confirm;
pub mod disk;
pub mod engine;
pub mod filter;
pub mod fingerprint;
pub mod retry;
pub mod scanner;

pub use comparator::{diff_dirs, diff_files, DirDiff, FileDiff, RestoreKind};
pub use confirm::{AutoConfirm, Confirmer, ModifiedFile, RestoreMode, RestorePlan};
pub use engine::{
    DifferenceReport, Operation, SyncConfig, SyncEngine, SyncProgress, SyncReport, SyncStatus,
    SNAPSHOT_DIR_PREFIX,
};
pub use filter::ExclusionFilter;
pub use fingerprint::{Blake3Hasher, ContentHasher, FingerprintCache};
pub use retry::RetryPolicy;
pub use scanner::{DetailScan, FileDetail, PathScan, TreeScanner};
