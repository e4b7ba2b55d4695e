//! 统一调度器
//!
//! 文件与文件夹任务共享一条 FIFO 准入队列，并发上限可配置。
//! 槽位在同一次锁持有内同步保留，先占槽再启动执行器，
//! 避免两次几乎同时的准入读到过期的活动数而超发。

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::core::conflict::ConflictResolver;
use crate::core::executor::{self, ExecContext};
use crate::core::job::{
    AbortController, AbortReason, Direction, JobSpec, JobStatus, PauseGate, TransferJob,
};
use crate::core::progress::{ProgressBus, ProgressUpdate, TransferProgress};
use crate::error::{JobOutcome, JobResult};
use crate::session::{RemoteSession, SessionGuard};
use crate::ui::TransferUi;

/// 并发上限的允许区间
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// 入队回执：任务 id 与最终结算的接收端
pub struct JobTicket {
    pub id: String,
    pub outcome: oneshot::Receiver<JobResult>,
}

struct QueuedJob {
    job: TransferJob,
    abort: AbortController,
    done: oneshot::Sender<JobResult>,
}

struct ActiveJob {
    abort: AbortController,
    pause: Option<PauseGate>,
}

struct SchedState {
    queue: VecDeque<QueuedJob>,
    active: HashMap<String, ActiveJob>,
    max_concurrency: usize,
    next_seq: u64,
}

struct SchedulerInner {
    session: Arc<dyn RemoteSession>,
    resolver: Arc<ConflictResolver>,
    progress: Arc<ProgressBus>,
    ui: Arc<dyn TransferUi>,
    guard: SessionGuard,
    state: Mutex<SchedState>,
}

/// 传输调度器
///
/// 队列、活动集与计数器全部私有，外界只能通过下面的方法交互。
pub struct TransferScheduler {
    inner: Arc<SchedulerInner>,
}

impl TransferScheduler {
    pub fn new(session: Arc<dyn RemoteSession>, ui: Arc<dyn TransferUi>) -> Self {
        Self::with_config(session, ui, TransferConfig::default())
    }

    pub fn with_config(
        session: Arc<dyn RemoteSession>,
        ui: Arc<dyn TransferUi>,
        config: TransferConfig,
    ) -> Self {
        let resolver = Arc::new(ConflictResolver::new(
            ui.clone(),
            Duration::from_secs(config.reserve_ttl_secs),
        ));
        let progress = Arc::new(ProgressBus::new(Duration::from_millis(
            config.progress_interval_ms,
        )));
        Self {
            inner: Arc::new(SchedulerInner {
                session,
                resolver,
                progress,
                ui,
                guard: SessionGuard::new(),
                state: Mutex::new(SchedState {
                    queue: VecDeque::new(),
                    active: HashMap::new(),
                    max_concurrency: config.clamped_concurrency(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// 提交下载任务
    pub fn enqueue_download(&self, spec: JobSpec) -> Result<JobTicket> {
        self.enqueue(spec, Direction::Download)
    }

    /// 提交上传任务
    pub fn enqueue_upload(&self, spec: JobSpec) -> Result<JobTicket> {
        if spec.local_path.is_none() {
            anyhow::bail!("上传任务必须提供本地源路径");
        }
        self.enqueue(spec, Direction::Upload)
    }

    fn enqueue(&self, spec: JobSpec, direction: Direction) -> Result<JobTicket> {
        let (done_tx, done_rx) = oneshot::channel();
        let job = {
            let mut st = self.inner.state.lock().unwrap();

            let seq = st.next_seq;
            let job = TransferJob::from_spec(spec, direction, seq);
            // id 在队列与活动集范围内必须唯一，终结并清除后方可复用
            if st.queue.iter().any(|q| q.job.id == job.id) || st.active.contains_key(&job.id) {
                anyhow::bail!("任务 id 已存在: {}", job.id);
            }
            st.next_seq += 1;

            // 入队即广播 queued 快照；总线锁是叶子锁，嵌套安全
            self.inner.progress.register(&job);
            st.queue.push_back(QueuedJob {
                job: job.clone(),
                abort: AbortController::new(),
                done: done_tx,
            });
            job
        };

        debug!("任务入队: {} ({} {})", job.id, job.direction_label(), job.remote_path);
        Self::pump(&self.inner);
        Ok(JobTicket {
            id: job.id,
            outcome: done_rx,
        })
    }

    /// 取消单个任务（幂等）
    ///
    /// 先查队列：排队中的任务直接移除并结算，不会发生任何 I/O；
    /// 再查活动集：向执行器发中止信号，由执行器负责清理与结算。
    pub fn cancel(&self, id: &str, reason: AbortReason) -> bool {
        let queued = {
            let mut st = self.inner.state.lock().unwrap();
            st.queue
                .iter()
                .position(|q| q.job.id == id)
                .and_then(|pos| st.queue.remove(pos))
        };
        if let Some(q) = queued {
            info!("取消排队任务: {} ({})", id, reason);
            q.abort.abort(reason);
            Self::finish_job(&self.inner, id, Ok(JobOutcome::Cancelled { reason }), q.done);
            return true;
        }

        let abort = {
            let st = self.inner.state.lock().unwrap();
            st.active.get(id).map(|a| a.abort.clone())
        };
        match abort {
            Some(abort) => {
                info!("中止活动任务: {} ({})", id, reason);
                abort.abort(reason)
            }
            None => false,
        }
    }

    /// 连接拆除：拒绝全部排队任务并中止全部活动任务
    pub fn cancel_all(&self, reason: AbortReason) {
        let (drained, aborts) = {
            let mut st = self.inner.state.lock().unwrap();
            let drained: Vec<QueuedJob> = st.queue.drain(..).collect();
            let aborts: Vec<AbortController> =
                st.active.values().map(|a| a.abort.clone()).collect();
            (drained, aborts)
        };

        info!(
            "cancel_all({}): 清空 {} 个排队任务, 中止 {} 个活动任务",
            reason,
            drained.len(),
            aborts.len()
        );
        for q in drained {
            q.abort.abort(reason);
            Self::finish_job(
                &self.inner,
                &q.job.id,
                Ok(JobOutcome::Cancelled { reason }),
                q.done,
            );
        }
        for abort in aborts {
            abort.abort(reason);
        }

        // "应用到全部"记忆随连接一起失效
        self.inner.resolver.reset_session();
    }

    /// 调整并发上限，夹取到 [1, 10]
    ///
    /// 只约束后续准入；降低上限不会抢占已活动的任务。
    pub fn set_max_concurrency(&self, n: usize) {
        let clamped = n.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        if clamped != n {
            warn!("并发上限 {} 越界，夹取为 {}", n, clamped);
        }
        self.inner.state.lock().unwrap().max_concurrency = clamped;
        Self::pump(&self.inner);
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.state.lock().unwrap().max_concurrency
    }

    /// 暂停上传任务；下载任务不支持暂停
    pub fn pause(&self, id: &str) -> bool {
        let gate = {
            let st = self.inner.state.lock().unwrap();
            st.active.get(id).and_then(|a| a.pause.clone())
        };
        match gate {
            Some(gate) => {
                gate.pause();
                self.inner.progress.report(
                    id,
                    ProgressUpdate {
                        status: Some(JobStatus::Paused),
                        ..Default::default()
                    },
                );
                true
            }
            None => {
                debug!("任务不支持暂停或不在活动集: {}", id);
                false
            }
        }
    }

    /// 恢复被暂停的上传任务
    pub fn resume(&self, id: &str) -> bool {
        let gate = {
            let st = self.inner.state.lock().unwrap();
            st.active.get(id).and_then(|a| a.pause.clone())
        };
        match gate {
            Some(gate) => {
                gate.resume();
                self.inner.progress.report(
                    id,
                    ProgressUpdate {
                        status: Some(JobStatus::Active),
                        ..Default::default()
                    },
                );
                true
            }
            None => false,
        }
    }

    /// 订阅进度快照
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TransferProgress> {
        self.inner.progress.subscribe()
    }

    /// 活动任务数
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    /// 排队任务数
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// 申请会话独占区（预览抓取等临时操作用）
    pub fn try_exclusive(&self) -> Result<crate::session::ExclusiveOp> {
        self.inner.guard.try_exclusive()
    }

    /// 准入循环：有空槽且队列非空时，出队最旧任务并启动执行器。
    ///
    /// 占槽（写入活动集）发生在锁内，随后才 spawn 执行器；
    /// 除了新入队，只有执行器结束释放槽位时会再次驱动本循环。
    fn pump(inner: &Arc<SchedulerInner>) {
        loop {
            let admitted = {
                let mut st = inner.state.lock().unwrap();
                if st.active.len() >= st.max_concurrency {
                    None
                } else if let Some(q) = st.queue.pop_front() {
                    let pause = match q.job.direction {
                        Direction::Upload => Some(PauseGate::new()),
                        Direction::Download => None,
                    };
                    st.active.insert(
                        q.job.id.clone(),
                        ActiveJob {
                            abort: q.abort.clone(),
                            pause: pause.clone(),
                        },
                    );
                    Some((q, pause))
                } else {
                    None
                }
            };

            let Some((q, pause)) = admitted else { break };
            let inner = inner.clone();
            tokio::spawn(async move {
                Self::run_job(inner, q, pause).await;
            });
        }
    }

    async fn run_job(inner: Arc<SchedulerInner>, q: QueuedJob, pause: Option<PauseGate>) {
        let job = q.job;
        let id = job.id.clone();

        // 无论以何种路径退出都释放槽位并立即重新评估队列
        let release_inner = inner.clone();
        let release_id = id.clone();
        scopeguard::defer! {
            release_inner
                .state
                .lock()
                .unwrap()
                .active
                .remove(&release_id);
            Self::pump(&release_inner);
        }

        inner.progress.report(
            &id,
            ProgressUpdate {
                status: Some(JobStatus::Active),
                ..Default::default()
            },
        );
        debug!("任务开始执行: {}", id);

        let ctx = ExecContext {
            session: inner.session.clone(),
            ui: inner.ui.clone(),
            resolver: inner.resolver.clone(),
            progress: inner.progress.clone(),
            job,
            abort: q.abort,
            pause,
        };
        let result = executor::run(ctx).await;
        Self::finish_job(&inner, &id, result, q.done);
    }

    /// 唯一的终态出口：每个任务恰好发出一次终态快照并结算票据
    fn finish_job(
        inner: &Arc<SchedulerInner>,
        id: &str,
        result: JobResult,
        done: oneshot::Sender<JobResult>,
    ) {
        let status = match &result {
            Ok(JobOutcome::Completed { .. }) => JobStatus::Completed,
            Ok(JobOutcome::Skipped) | Ok(JobOutcome::ConflictCancelled) => JobStatus::Cancelled,
            Ok(JobOutcome::Cancelled { reason }) => match reason {
                AbortReason::Cancelled => JobStatus::Cancelled,
                AbortReason::Failed => JobStatus::Failed,
            },
            Err(_) => JobStatus::Failed,
        };
        match &result {
            Ok(outcome) => info!("任务终结: {} -> {} ({:?})", id, status, outcome),
            Err(e) => warn!("任务失败: {} -> {}", id, e),
        }

        inner.progress.report(
            id,
            ProgressUpdate {
                status: Some(status),
                speed: Some(0),
                eta: Some(0),
                end_time: Some(chrono::Utc::now().timestamp()),
                ..Default::default()
            },
        );
        // 调用方可能已放弃票据
        let _ = done.send(result);
    }
}

impl TransferJob {
    fn direction_label(&self) -> &'static str {
        match self.direction {
            Direction::Download => "下载",
            Direction::Upload => "上传",
        }
    }
}
