//! 传输执行器
//!
//! 四个驱动：文件/文件夹 × 下载/上传。块间与文件间是协作式
//! 检查点，块内不抢占；中止后不再转发任何进度回调。
//! 部分产物只在中止与传输故障时清理，跳过/对话框取消不产生产物。

use anyhow::Result;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::core::collector::{collect_local, collect_remote};
use crate::core::conflict::{ConflictAction, ConflictResolver};
use crate::core::job::{
    AbortController, Direction, JobKind, PauseGate, TransferJob,
};
use crate::core::progress::{ProgressBus, ProgressUpdate};
use crate::error::{JobOutcome, JobResult, TransferError};
use crate::session::{join_remote, remote_file_name, RemoteSession};
use crate::ui::TransferUi;

const CHUNK_SIZE: usize = 64 * 1024;

/// 执行器上下文，由调度器在占槽后组装
pub(crate) struct ExecContext {
    pub session: Arc<dyn RemoteSession>,
    pub ui: Arc<dyn TransferUi>,
    pub resolver: Arc<ConflictResolver>,
    pub progress: Arc<ProgressBus>,
    pub job: TransferJob,
    pub abort: AbortController,
    pub pause: Option<PauseGate>,
}

/// 执行一个任务并折叠用户选择类错误
pub(crate) async fn run(ctx: ExecContext) -> JobResult {
    let result = match (ctx.job.kind, ctx.job.direction) {
        (JobKind::File, Direction::Download) => download_file(&ctx).await,
        (JobKind::File, Direction::Upload) => upload_file(&ctx).await,
        (JobKind::Folder, Direction::Download) => download_folder(&ctx).await,
        (JobKind::Folder, Direction::Upload) => upload_folder(&ctx).await,
    };
    // 用户选择不是异常：跳过/取消以成功结算返回标记
    match result {
        Ok(outcome) => Ok(outcome),
        Err(TransferError::Aborted { reason }) => Ok(JobOutcome::Cancelled { reason }),
        Err(TransferError::Skipped) => Ok(JobOutcome::Skipped),
        Err(TransferError::ConflictCancelled) => Ok(JobOutcome::ConflictCancelled),
        Err(e) => Err(e),
    }
}

// ============ 进度计量 ============

/// 跨文件累计的进度计量器，中止后静默
#[derive(Clone)]
struct ProgressMeter {
    bus: Arc<ProgressBus>,
    abort: AbortController,
    job_id: String,
    started: Instant,
    total_bytes: u64,
    transferred: Arc<AtomicU64>,
    completed_files: Arc<AtomicU32>,
}

impl ProgressMeter {
    fn new(ctx: &ExecContext, total_bytes: u64, total_files: u32) -> Self {
        let meter = Self {
            bus: ctx.progress.clone(),
            abort: ctx.abort.clone(),
            job_id: ctx.job.id.clone(),
            started: Instant::now(),
            total_bytes,
            transferred: Arc::new(AtomicU64::new(0)),
            completed_files: Arc::new(AtomicU32::new(0)),
        };
        meter.emit(ProgressUpdate {
            total_bytes: Some(total_bytes),
            total_files: Some(total_files),
            ..Default::default()
        });
        meter
    }

    fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn on_chunk(&self, n: u64) {
        let transferred = self.transferred.fetch_add(n, Ordering::Relaxed) + n;
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (transferred as f64 / elapsed) as u64
        } else {
            0
        };
        let eta = if speed > 0 && self.total_bytes > transferred {
            (self.total_bytes - transferred) / speed
        } else {
            0
        };
        self.emit(ProgressUpdate {
            transferred_bytes: Some(transferred),
            speed: Some(speed),
            eta: Some(eta),
            ..Default::default()
        });
    }

    fn set_current(&self, file: &str) {
        self.emit(ProgressUpdate {
            current_file: Some(file.to_string()),
            ..Default::default()
        });
    }

    fn file_done(&self) {
        let done = self.completed_files.fetch_add(1, Ordering::Relaxed) + 1;
        self.emit(ProgressUpdate {
            completed_files: Some(done),
            ..Default::default()
        });
    }

    fn emit(&self, update: ProgressUpdate) {
        // 中止请求之后不再转发进度，即使回调仍在触发
        if self.abort.is_aborted() {
            return;
        }
        self.bus.report(&self.job_id, update);
    }
}

// ============ 公共辅助 ============

fn aborted(ctx: &ExecContext) -> TransferError {
    TransferError::Aborted {
        reason: ctx.abort.reason_or_cancelled(),
    }
}

fn checkpoint(ctx: &ExecContext) -> Result<(), TransferError> {
    if ctx.abort.is_aborted() {
        Err(aborted(ctx))
    } else {
        Ok(())
    }
}

/// 目标目录当前已存在的本地名字
fn local_names(dir: &Path) -> HashSet<String> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => HashSet::new(),
    }
}

/// 目标目录当前已存在的远端名字
///
/// 冲突探测列取失败属于传输故障，整个任务按失败结算，
/// 不允许按空目录继续。
async fn remote_names(
    session: &dyn RemoteSession,
    dir: &str,
) -> Result<HashSet<String>, TransferError> {
    let entries = session.list(dir).await.map_err(TransferError::Transport)?;
    Ok(entries.into_iter().map(|e| e.name).collect())
}

/// 解决目标名冲突；跳过与对话框取消直接终止任务
///
/// 卡在弹窗（或排队等弹窗）期间也要能被中止信号立即结算，
/// 连接拆除不等用户关对话框。
async fn settle_conflict(
    ctx: &ExecContext,
    name: &str,
    existing: &HashSet<String>,
) -> Result<(ConflictAction, String), TransferError> {
    let resolved = tokio::select! {
        r = ctx
            .resolver
            .resolve(name, existing, ctx.job.conflict_policy, ctx.job.apply_to_all) =>
        {
            r.map_err(TransferError::Transport)?
        }
        _ = ctx.abort.aborted() => return Err(aborted(ctx)),
    };
    debug!(
        "冲突解决: {} -> {} ({}{})",
        name,
        resolved.final_name,
        resolved.action,
        if resolved.from_memory { ", 记忆" } else { "" }
    );
    match resolved.action {
        ConflictAction::Skip => Err(TransferError::Skipped),
        ConflictAction::CancelDialog => Err(TransferError::ConflictCancelled),
        action => Ok((action, resolved.final_name)),
    }
}

async fn remove_partial_local(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("清理部分下载文件失败: {} - {}", path.display(), e);
    } else {
        debug!("已删除部分下载文件: {}", path.display());
    }
}

async fn remove_partial_remote(session: &dyn RemoteSession, path: &str) {
    // 尽力而为，远端清理失败不改变任务结局
    if let Err(e) = session.delete(path).await {
        warn!("清理部分上传文件失败: {} - {}", path, e);
    } else {
        debug!("已删除部分上传文件: {}", path);
    }
}

// ============ 下载 ============

/// 流式写入本地文件；中止与传输故障都会删除半成品
async fn copy_remote_file(
    ctx: &ExecContext,
    remote: &str,
    dest: &Path,
    meter: &ProgressMeter,
) -> Result<u64, TransferError> {
    let result = stream_to_local(ctx, remote, dest, meter).await;
    match result {
        Ok(n) if !ctx.abort.is_aborted() => Ok(n),
        Ok(_) => {
            remove_partial_local(dest).await;
            Err(aborted(ctx))
        }
        Err(e) => {
            remove_partial_local(dest).await;
            Err(e)
        }
    }
}

async fn stream_to_local(
    ctx: &ExecContext,
    remote: &str,
    dest: &Path,
    meter: &ProgressMeter,
) -> Result<u64, TransferError> {
    let mut stream = ctx
        .session
        .open_read(remote)
        .await
        .map_err(TransferError::Transport)?;
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    let mut written = 0u64;
    loop {
        // 每块之前的协作检查点
        if ctx.abort.is_aborted() {
            return Err(aborted(ctx));
        }
        let Some(chunk) = stream.next().await else {
            break;
        };
        let chunk = chunk.map_err(TransferError::Transport)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| TransferError::Transport(e.into()))?;
        written += chunk.len() as u64;
        meter.on_chunk(chunk.len() as u64);
    }
    file.flush()
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;
    Ok(written)
}

async fn download_file(ctx: &ExecContext) -> Result<JobOutcome, TransferError> {
    checkpoint(ctx)?;
    let job = &ctx.job;
    let remote_name = remote_file_name(&job.remote_path).to_string();

    // 目标目录与初始目标名；未提供本地路径时走保存对话框
    let (dir, initial) = match &job.local_path {
        Some(p) if p.is_dir() => (p.clone(), remote_name.clone()),
        Some(p) => {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| remote_name.clone());
            let dir = p
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, name)
        }
        None => {
            let chosen = ctx
                .ui
                .show_save_dialog(&remote_name)
                .await
                .map_err(TransferError::Transport)?;
            let Some(p) = chosen else {
                return Err(TransferError::ConflictCancelled);
            };
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| remote_name.clone());
            let dir = p
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, name)
        }
    };

    let existing = local_names(&dir);
    let name = if existing.contains(&initial) {
        settle_conflict(ctx, &initial, &existing).await?.1
    } else {
        initial
    };
    checkpoint(ctx)?;

    // 总量：调用方提示优先，否则远端 stat
    let total = match job.total_bytes {
        Some(n) => n,
        None => ctx
            .session
            .stat(&job.remote_path)
            .await
            .map_err(TransferError::Transport)?
            .map(|m| m.size)
            .unwrap_or(0),
    };

    let meter = ProgressMeter::new(ctx, total, 1);
    meter.set_current(&name);

    let dest = dir.join(&name);
    let bytes = copy_remote_file(ctx, &job.remote_path, &dest, &meter).await?;
    meter.file_done();
    Ok(JobOutcome::Completed { bytes, files: 1 })
}

async fn download_folder(ctx: &ExecContext) -> Result<JobOutcome, TransferError> {
    checkpoint(ctx)?;
    let job = &ctx.job;
    let folder_name = remote_file_name(&job.remote_path).to_string();

    // 本地路径是父目录，最终目录名在这里才定下来
    let parent = match &job.local_path {
        Some(p) => p.clone(),
        None => {
            let chosen = ctx
                .ui
                .show_save_dialog(&folder_name)
                .await
                .map_err(TransferError::Transport)?;
            let Some(p) = chosen else {
                return Err(TransferError::ConflictCancelled);
            };
            p
        }
    };

    let existing = local_names(&parent);
    let (name, replace) = if existing.contains(&folder_name) {
        let (action, name) = settle_conflict(ctx, &folder_name, &existing).await?;
        (name, action == ConflictAction::Overwrite)
    } else {
        (folder_name, false)
    };
    checkpoint(ctx)?;

    let entries = collect_remote(ctx.session.as_ref(), &job.remote_path, &ctx.abort)
        .await
        .map_err(|e| {
            if ctx.abort.is_aborted() {
                aborted(ctx)
            } else {
                TransferError::Enumeration(e)
            }
        })?;

    let meter = ProgressMeter::new(ctx, entries.total_bytes, entries.total_files);
    let dest_root = parent.join(&name);

    // 覆盖即替换整棵目标树
    if replace && dest_root.exists() {
        tokio::fs::remove_dir_all(&dest_root)
            .await
            .map_err(|e| TransferError::Transport(e.into()))?;
    }
    tokio::fs::create_dir_all(&dest_root)
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    // 先建全部目录再传任何文件，收集顺序保证父目录在前
    for d in &entries.dirs {
        tokio::fs::create_dir_all(dest_root.join(&d.relative_path))
            .await
            .map_err(|e| TransferError::Transport(e.into()))?;
    }

    for f in &entries.files {
        // 每个文件之前的协作检查点
        checkpoint(ctx)?;
        meter.set_current(&f.relative_path);
        let remote = join_remote(&job.remote_path, &f.relative_path);
        let dest = dest_root.join(&f.relative_path);
        copy_remote_file(ctx, &remote, &dest, &meter).await?;
        meter.file_done();
    }

    Ok(JobOutcome::Completed {
        bytes: meter.transferred(),
        files: entries.total_files,
    })
}

// ============ 上传 ============

/// 上传源流的驱动状态
struct UploadSource {
    reader: ReaderStream<tokio::fs::File>,
    abort: AbortController,
    pause: Option<PauseGate>,
    meter: ProgressMeter,
}

/// 流式上传单个文件；中止与传输故障都尽力删除远端半成品
async fn upload_one(
    ctx: &ExecContext,
    local: &Path,
    remote_target: &str,
    meter: &ProgressMeter,
    size_hint: Option<u64>,
) -> Result<u64, TransferError> {
    if ctx.abort.is_aborted() {
        return Err(aborted(ctx));
    }
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;
    let before = meter.transferred();

    let source = UploadSource {
        reader: ReaderStream::with_capacity(file, CHUNK_SIZE),
        abort: ctx.abort.clone(),
        pause: ctx.pause.clone(),
        meter: meter.clone(),
    };
    let body = futures::stream::unfold(source, |mut st| async move {
        // 暂停挂起点：resume 或中止都会释放续体
        if let Some(gate) = &st.pause {
            gate.wait_if_paused(&st.abort).await;
        }
        if st.abort.is_aborted() {
            // 提前收束源流，半成品由上层清理
            return None;
        }
        match st.reader.next().await {
            Some(Ok(chunk)) => {
                st.meter.on_chunk(chunk.len() as u64);
                Some((Ok(chunk), st))
            }
            Some(Err(e)) => Some((Err(anyhow::Error::from(e)), st)),
            None => None,
        }
    });

    let result = ctx
        .session
        .write_stream(remote_target, Box::pin(body), size_hint)
        .await;

    if ctx.abort.is_aborted() {
        remove_partial_remote(ctx.session.as_ref(), remote_target).await;
        return Err(aborted(ctx));
    }
    match result {
        Ok(()) => Ok(meter.transferred() - before),
        Err(e) => {
            remove_partial_remote(ctx.session.as_ref(), remote_target).await;
            Err(TransferError::Transport(e))
        }
    }
}

async fn upload_file(ctx: &ExecContext) -> Result<JobOutcome, TransferError> {
    checkpoint(ctx)?;
    let job = &ctx.job;
    let local = job
        .local_path
        .as_ref()
        .ok_or_else(|| TransferError::Transport(anyhow::anyhow!("缺少本地源路径")))?;
    let initial = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            TransferError::Transport(anyhow::anyhow!("无效的本地路径: {}", local.display()))
        })?;

    let existing = remote_names(ctx.session.as_ref(), &job.remote_path).await?;
    let name = if existing.contains(&initial) {
        settle_conflict(ctx, &initial, &existing).await?.1
    } else {
        initial
    };
    checkpoint(ctx)?;

    let total = match job.total_bytes {
        Some(n) => n,
        None => tokio::fs::metadata(local)
            .await
            .map_err(|e| TransferError::Transport(e.into()))?
            .len(),
    };

    let meter = ProgressMeter::new(ctx, total, 1);
    meter.set_current(&name);

    let remote_target = join_remote(&job.remote_path, &name);
    let bytes = upload_one(ctx, local, &remote_target, &meter, Some(total)).await?;
    meter.file_done();
    Ok(JobOutcome::Completed { bytes, files: 1 })
}

async fn upload_folder(ctx: &ExecContext) -> Result<JobOutcome, TransferError> {
    checkpoint(ctx)?;
    let job = &ctx.job;
    let local_root = job
        .local_path
        .as_ref()
        .ok_or_else(|| TransferError::Transport(anyhow::anyhow!("缺少本地源路径")))?;
    let folder_name = local_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            TransferError::Transport(anyhow::anyhow!(
                "无效的本地路径: {}",
                local_root.display()
            ))
        })?;

    let existing = remote_names(ctx.session.as_ref(), &job.remote_path).await?;
    let (name, replace) = if existing.contains(&folder_name) {
        let (action, name) = settle_conflict(ctx, &folder_name, &existing).await?;
        (name, action == ConflictAction::Overwrite)
    } else {
        (folder_name, false)
    };
    checkpoint(ctx)?;

    let entries = collect_local(local_root, ctx.abort.clone())
        .await
        .map_err(|e| {
            if ctx.abort.is_aborted() {
                aborted(ctx)
            } else {
                TransferError::Enumeration(e)
            }
        })?;

    let meter = ProgressMeter::new(ctx, entries.total_bytes, entries.total_files);
    let remote_root = join_remote(&job.remote_path, &name);

    // 覆盖即替换整棵目标树
    if replace {
        ctx.session
            .remove_dir(&remote_root, true)
            .await
            .map_err(TransferError::Transport)?;
    }
    ctx.session
        .mkdir(&remote_root, true)
        .await
        .map_err(TransferError::Transport)?;

    // 先建全部目录，父目录保证在前
    for d in &entries.dirs {
        ctx.session
            .mkdir(&join_remote(&remote_root, &d.relative_path), false)
            .await
            .map_err(TransferError::Transport)?;
    }

    for f in &entries.files {
        checkpoint(ctx)?;
        meter.set_current(&f.relative_path);
        let local = local_root.join(&f.relative_path);
        let remote = join_remote(&remote_root, &f.relative_path);
        upload_one(ctx, &local, &remote, &meter, Some(f.size)).await?;
        meter.file_done();
    }

    Ok(JobOutcome::Completed {
        bytes: meter.transferred(),
        files: entries.total_files,
    })
}
