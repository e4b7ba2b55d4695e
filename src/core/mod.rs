pub mod collector;
pub mod conflict;
pub(crate) mod executor;
pub mod job;
pub mod progress;
pub mod scheduler;

pub use collector::{collect_local, collect_remote, CollectedEntries, DirEntry, FileEntry};
pub use conflict::{next_available_name, ConflictAction, ConflictResolver, ResolvedConflict};
pub use job::{
    AbortController, AbortReason, ConflictPolicy, Direction, JobKind, JobSpec, JobStatus,
    PauseGate, TransferJob,
};
pub use progress::{ProgressBus, ProgressUpdate, TransferProgress};
pub use scheduler::{JobTicket, TransferScheduler, MAX_CONCURRENCY, MIN_CONCURRENCY};
