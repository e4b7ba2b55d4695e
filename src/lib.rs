//! 远程文件传输调度库
//!
//! 提供统一的传输任务队列：入列、并发调度、冲突解决、
//! 进度广播与协作式取消，下载与上传共用一条调度通道。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod session;
pub mod ui;

pub use config::TransferConfig;
pub use core::{
    AbortReason, ConflictAction, ConflictPolicy, Direction, JobKind, JobSpec, JobStatus,
    JobTicket, ProgressBus, TransferProgress, TransferScheduler,
};
pub use error::{JobOutcome, JobResult, TransferError};
pub use session::{ByteStream, RemoteEntry, RemoteMeta, RemoteSession, SessionGuard};
pub use ui::{ConflictChoice, TransferUi};

/// 平台配置目录，不引第三方 crate 直接读环境变量
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
