//! 任务模型与中止控制

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    File,
    Folder,
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

/// 任务状态
///
/// queued → active → {completed, failed, cancelled}，
/// 仅上传任务支持 active ⇄ paused。三个结果态是终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态机合法迁移检查
    pub fn can_transition(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Active | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Active => next != JobStatus::Queued && next != JobStatus::Active,
            JobStatus::Paused => matches!(
                next,
                JobStatus::Active | JobStatus::Cancelled | JobStatus::Failed
            ),
            // 终态不再迁移
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => JobStatus::Active,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Queued,
        }
    }
}

/// 中止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortReason {
    /// 用户主动取消
    Cancelled,
    /// 连接丢失等故障
    Failed,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Failed => write!(f, "failed"),
        }
    }
}

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Overwrite,
    Rename,
    Skip,
    Prompt,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::Overwrite => write!(f, "overwrite"),
            ConflictPolicy::Rename => write!(f, "rename"),
            ConflictPolicy::Skip => write!(f, "skip"),
            ConflictPolicy::Prompt => write!(f, "prompt"),
        }
    }
}

impl From<&str> for ConflictPolicy {
    fn from(s: &str) -> Self {
        match s {
            "overwrite" => ConflictPolicy::Overwrite,
            "rename" => ConflictPolicy::Rename,
            "skip" => ConflictPolicy::Skip,
            _ => ConflictPolicy::Prompt,
        }
    }
}

fn default_policy() -> ConflictPolicy {
    ConflictPolicy::Prompt
}

/// 调用方提交的任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// 未提供时自动生成 uuid
    #[serde(default)]
    pub id: Option<String>,
    pub kind: JobKind,
    /// 下载时为远端源路径；上传时为远端目标父目录
    pub remote_path: String,
    /// 下载单文件时可省略，由保存对话框决定；
    /// 文件夹下载时为本地父目录
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub total_files: Option<u32>,
    #[serde(default = "default_policy")]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub apply_to_all: bool,
}

/// 队列内部的任务记录
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: String,
    pub kind: JobKind,
    pub direction: Direction,
    pub remote_path: String,
    pub local_path: Option<PathBuf>,
    pub total_bytes: Option<u64>,
    pub total_files: Option<u32>,
    pub conflict_policy: ConflictPolicy,
    pub apply_to_all: bool,
    /// 单调入队时间，FIFO 主排序键
    pub enqueued_at: Instant,
    /// 入队序号，同刻入队的并列裁决
    pub seq: u64,
}

impl TransferJob {
    pub fn from_spec(spec: JobSpec, direction: Direction, seq: u64) -> Self {
        Self {
            id: spec
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: spec.kind,
            direction,
            remote_path: spec.remote_path,
            local_path: spec.local_path,
            total_bytes: spec.total_bytes,
            total_files: spec.total_files,
            conflict_policy: spec.conflict_policy,
            apply_to_all: spec.apply_to_all,
            enqueued_at: Instant::now(),
            seq,
        }
    }
}

/// 幂等中止句柄
///
/// 第一次 `abort` 固定原因，后续调用全部折叠为 no-op。
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    reason: Mutex<Option<AbortReason>>,
    flag: AtomicBool,
    notify: Notify,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求中止，返回本次调用是否生效
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut guard = self.inner.reason.lock().unwrap();
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason);
        }
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.inner.reason.lock().unwrap()
    }

    /// 已生效的中止原因，未中止时按用户取消处理
    pub fn reason_or_cancelled(&self) -> AbortReason {
        self.reason().unwrap_or(AbortReason::Cancelled)
    }

    /// 挂起直到中止被请求
    pub async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            // 先注册到等待队列再复查标志，
            // 否则 notify_waiters 可能落在注册之前而永远丢失
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// 上传暂停门
///
/// 暂停后源流停止被消费，resume 或中止时释放挂起的续体。
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    inner: Arc<PauseInner>,
}

#[derive(Debug, Default)]
struct PauseInner {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// 暂停期间的挂起点，中止同样会解除挂起
    pub async fn wait_if_paused(&self, abort: &AbortController) {
        loop {
            if !self.is_paused() || abort.is_aborted() {
                return;
            }
            // 同 AbortController::aborted：先注册再复查，
            // 避免 resume 的唤醒落在注册之前
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_paused() || abort.is_aborted() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = abort.aborted() => {}
            }
        }
    }
}
