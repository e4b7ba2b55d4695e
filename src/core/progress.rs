//! 进度总线
//!
//! 把逐块回调合并成按任务 id 的节流快照并广播给所有订阅者。
//! 终态快照发出后立即清除存储，任务 id 方可复用。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::core::job::{Direction, JobKind, JobStatus, TransferJob};

/// 广播给观察者的进度快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub kind: JobKind,
    pub direction: Direction,
    pub current_file: String,
    pub transferred_bytes: u64,
    /// 0 表示尚未得知总量
    pub total_bytes: u64,
    pub completed_files: u32,
    pub total_files: u32,
    /// 字节/秒
    pub speed: u64,
    /// 预计剩余秒数，无法估计时为 0
    pub eta: u64,
    pub start_time: i64,
    /// 完成时间（0 表示未完成）
    pub end_time: i64,
}

/// 部分更新，缺失字段继承上一快照
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<JobStatus>,
    pub current_file: Option<String>,
    pub transferred_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub completed_files: Option<u32>,
    pub total_files: Option<u32>,
    pub speed: Option<u64>,
    pub eta: Option<u64>,
    pub end_time: Option<i64>,
}

struct Tracked {
    snapshot: TransferProgress,
    last_emit: Option<Instant>,
}

struct BusInner {
    snapshots: HashMap<String, Tracked>,
    observers: Vec<mpsc::UnboundedSender<TransferProgress>>,
}

/// 进度总线
pub struct ProgressBus {
    inner: Mutex<BusInner>,
    /// 非状态变化广播的最小间隔
    min_interval: Duration,
}

impl ProgressBus {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                snapshots: HashMap::new(),
                observers: Vec::new(),
            }),
            min_interval,
        }
    }

    /// 订阅快照广播
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferProgress> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().observers.push(tx);
        rx
    }

    /// 登记任务并立即广播 queued 快照
    pub fn register(&self, job: &TransferJob) {
        let snapshot = TransferProgress {
            job_id: job.id.clone(),
            status: JobStatus::Queued,
            kind: job.kind,
            direction: job.direction,
            current_file: String::new(),
            transferred_bytes: 0,
            total_bytes: job.total_bytes.unwrap_or(0),
            completed_files: 0,
            total_files: job.total_files.unwrap_or(0),
            speed: 0,
            eta: 0,
            start_time: chrono::Utc::now().timestamp(),
            end_time: 0,
        };
        let mut inner = self.inner.lock().unwrap();
        Self::broadcast(&mut inner.observers, snapshot.clone());
        inner.snapshots.insert(
            job.id.clone(),
            Tracked {
                snapshot,
                last_emit: Some(Instant::now()),
            },
        );
    }

    /// 合并部分更新并按需广播
    ///
    /// 状态变化与终态报告始终放行；纯字节进度按最小间隔节流。
    /// 终态广播后清除存储的快照。
    pub fn report(&self, job_id: &str, update: ProgressUpdate) {
        let mut inner = self.inner.lock().unwrap();
        let Some(tracked) = inner.snapshots.get_mut(job_id) else {
            // 未登记或已终结的任务，丢弃
            return;
        };

        let status_changed = update
            .status
            .map(|s| s != tracked.snapshot.status)
            .unwrap_or(false);
        merge(&mut tracked.snapshot, update);
        let terminal = tracked.snapshot.status.is_terminal();

        let throttled = !status_changed
            && !terminal
            && tracked
                .last_emit
                .map(|at| at.elapsed() < self.min_interval)
                .unwrap_or(false);
        if throttled {
            // 快照已合并，等待下一次放行统一带出
            return;
        }

        tracked.last_emit = Some(Instant::now());
        let snapshot = tracked.snapshot.clone();
        if terminal {
            inner.snapshots.remove(job_id);
        }
        Self::broadcast(&mut inner.observers, snapshot);
    }

    /// 当前存储的快照（终结后为 None）
    pub fn snapshot(&self, job_id: &str) -> Option<TransferProgress> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(job_id)
            .map(|t| t.snapshot.clone())
    }

    fn broadcast(observers: &mut Vec<mpsc::UnboundedSender<TransferProgress>>, snapshot: TransferProgress) {
        // 发送失败说明订阅者已离开，顺手剔除
        observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

fn merge(snapshot: &mut TransferProgress, update: ProgressUpdate) {
    if let Some(status) = update.status {
        snapshot.status = status;
    }
    if let Some(current_file) = update.current_file {
        snapshot.current_file = current_file;
    }
    if let Some(bytes) = update.transferred_bytes {
        snapshot.transferred_bytes = bytes;
    }
    if let Some(total) = update.total_bytes {
        snapshot.total_bytes = total;
    }
    if let Some(files) = update.completed_files {
        snapshot.completed_files = files;
    }
    if let Some(total) = update.total_files {
        snapshot.total_files = total;
    }
    if let Some(speed) = update.speed {
        snapshot.speed = speed;
    }
    if let Some(eta) = update.eta {
        snapshot.eta = eta;
    }
    if let Some(end) = update.end_time {
        snapshot.end_time = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{ConflictPolicy, JobSpec};

    fn test_job(id: &str) -> TransferJob {
        TransferJob::from_spec(
            JobSpec {
                id: Some(id.to_string()),
                kind: JobKind::File,
                remote_path: "/a.txt".to_string(),
                local_path: None,
                total_bytes: Some(100),
                total_files: None,
                conflict_policy: ConflictPolicy::Overwrite,
                apply_to_all: false,
            },
            Direction::Download,
            0,
        )
    }

    #[test]
    fn test_merge_inherits_missing_fields() {
        let bus = ProgressBus::new(Duration::ZERO);
        let mut rx = bus.subscribe();
        bus.register(&test_job("j1"));
        assert_eq!(rx.try_recv().unwrap().status, JobStatus::Queued);

        bus.report(
            "j1",
            ProgressUpdate {
                status: Some(JobStatus::Active),
                transferred_bytes: Some(40),
                ..Default::default()
            },
        );
        let got = rx.try_recv().unwrap();
        assert_eq!(got.transferred_bytes, 40);
        assert_eq!(got.total_bytes, 100);

        bus.report(
            "j1",
            ProgressUpdate {
                transferred_bytes: Some(60),
                ..Default::default()
            },
        );
        let got = rx.try_recv().unwrap();
        assert_eq!(got.transferred_bytes, 60);
        assert_eq!(got.status, JobStatus::Active);
    }

    #[test]
    fn test_terminal_report_purges_snapshot() {
        let bus = ProgressBus::new(Duration::ZERO);
        bus.register(&test_job("j1"));
        assert!(bus.snapshot("j1").is_some());

        bus.report(
            "j1",
            ProgressUpdate {
                status: Some(JobStatus::Completed),
                ..Default::default()
            },
        );
        assert!(bus.snapshot("j1").is_none());

        // 终结后的报告被丢弃
        bus.report(
            "j1",
            ProgressUpdate {
                transferred_bytes: Some(999),
                ..Default::default()
            },
        );
        assert!(bus.snapshot("j1").is_none());
    }

    #[test]
    fn test_throttle_passes_status_changes() {
        let bus = ProgressBus::new(Duration::from_secs(3600));
        let mut rx = bus.subscribe();
        bus.register(&test_job("j1"));
        let _ = rx.try_recv().unwrap();

        // 纯字节进度在间隔内被节流
        bus.report(
            "j1",
            ProgressUpdate {
                status: Some(JobStatus::Active),
                ..Default::default()
            },
        );
        let _ = rx.try_recv().unwrap();
        bus.report(
            "j1",
            ProgressUpdate {
                transferred_bytes: Some(10),
                ..Default::default()
            },
        );
        assert!(rx.try_recv().is_err());

        // 但合并仍然发生，终态报告带出合并后的值
        bus.report(
            "j1",
            ProgressUpdate {
                status: Some(JobStatus::Completed),
                ..Default::default()
            },
        );
        let got = rx.try_recv().unwrap();
        assert_eq!(got.transferred_bytes, 10);
        assert_eq!(got.status, JobStatus::Completed);
    }
}
