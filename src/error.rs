//! 传输错误分类

use thiserror::Error;

use crate::core::job::AbortReason;

/// 传输失败原因
///
/// `Aborted` / `ConflictCancelled` / `Skipped` 属于用户选择，
/// 调度器会把它们转换成成功结算的 [`JobOutcome`]；
/// `Transport` / `Enumeration` 才是真正的失败。
#[derive(Debug, Error)]
pub enum TransferError {
    /// 任务被显式中止（用户取消或连接断开）
    #[error("传输已中止: {reason}")]
    Aborted { reason: AbortReason },

    /// 用户在冲突对话框中选择了取消
    #[error("用户取消了冲突对话框")]
    ConflictCancelled,

    /// 冲突策略选择了跳过
    #[error("按冲突策略跳过")]
    Skipped,

    /// 底层会话协议错误
    #[error("传输失败: {0}")]
    Transport(anyhow::Error),

    /// 目录树枚举失败
    #[error("目录枚举失败: {0}")]
    Enumeration(anyhow::Error),
}

/// 任务的最终结算结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// 传输完成
    Completed { bytes: u64, files: u32 },
    /// 用户或策略选择跳过，未创建任何产物
    Skipped,
    /// 用户在对话框中取消，未创建任何产物
    ConflictCancelled,
    /// 任务被中止，部分产物已清理
    Cancelled { reason: AbortReason },
}

impl JobOutcome {
    /// 是否属于用户主动选择（跳过/对话框取消）
    pub fn is_user_declined(&self) -> bool {
        matches!(self, JobOutcome::Skipped | JobOutcome::ConflictCancelled)
    }
}

/// 任务票据最终解析出的结果
pub type JobResult = Result<JobOutcome, TransferError>;
