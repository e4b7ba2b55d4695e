//! 冲突解决集成测试：会话记忆、策略与重命名保留

mod common;

use common::{MockSession, MockUi};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use transtools::{
    ConflictAction, ConflictChoice, ConflictPolicy, JobKind, JobOutcome, JobSpec,
    TransferConfig, TransferScheduler,
};

fn test_config(max_concurrency: usize) -> TransferConfig {
    TransferConfig {
        max_concurrency,
        progress_interval_ms: 0,
        reserve_ttl_secs: 30,
    }
}

fn download_spec(id: &str, remote: &str, local_dir: &Path, policy: ConflictPolicy) -> JobSpec {
    JobSpec {
        id: Some(id.to_string()),
        kind: JobKind::File,
        remote_path: remote.to_string(),
        local_path: Some(local_dir.to_path_buf()),
        total_bytes: None,
        total_files: None,
        conflict_policy: policy,
        apply_to_all: false,
    }
}

#[tokio::test]
async fn test_apply_to_all_prompts_once() {
    let session = MockSession::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        session.add_file(&format!("/src/{}", name), b"remote");
    }
    let session = Arc::new(session);

    let dir = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.path().join(name), b"local").unwrap();
    }

    // 只预置一个选择：覆盖 + 应用到全部
    let ui = Arc::new(MockUi::new().with_conflict_choice(ConflictChoice {
        action: ConflictAction::Overwrite,
        apply_to_all: true,
    }));
    let sched = TransferScheduler::with_config(session, ui.clone(), test_config(3));

    let mut tickets = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let spec = download_spec(name, &format!("/src/{}", name), dir.path(), ConflictPolicy::Prompt);
        tickets.push(sched.enqueue_download(spec).unwrap());
    }
    for ticket in tickets {
        let outcome = ticket.outcome.await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
    }

    assert_eq!(ui.prompt_count(), 1, "勾选应用到全部后只允许弹一次窗");
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), b"remote");
    }
}

#[tokio::test]
async fn test_skip_and_cancel_dialog_settle_without_artifacts() {
    let session = MockSession::new();
    session.add_file("/src/s.txt", b"remote");
    session.add_file("/src/c.txt", b"remote");
    let session = Arc::new(session);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("s.txt"), b"local").unwrap();
    std::fs::write(dir.path().join("c.txt"), b"local").unwrap();

    let ui = Arc::new(
        MockUi::new()
            .with_conflict_choice(ConflictChoice {
                action: ConflictAction::Skip,
                apply_to_all: false,
            })
            .with_conflict_choice(ConflictChoice {
                action: ConflictAction::CancelDialog,
                apply_to_all: false,
            }),
    );
    let sched = TransferScheduler::with_config(session.clone(), ui, test_config(1));

    let skip = sched
        .enqueue_download(download_spec(
            "s",
            "/src/s.txt",
            dir.path(),
            ConflictPolicy::Prompt,
        ))
        .unwrap();
    let cancel = sched
        .enqueue_download(download_spec(
            "c",
            "/src/c.txt",
            dir.path(),
            ConflictPolicy::Prompt,
        ))
        .unwrap();

    assert_eq!(skip.outcome.await.unwrap().unwrap(), JobOutcome::Skipped);
    assert_eq!(
        cancel.outcome.await.unwrap().unwrap(),
        JobOutcome::ConflictCancelled
    );

    // 两个结果都属于用户主动选择，本地文件原样保留
    assert_eq!(std::fs::read(dir.path().join("s.txt")).unwrap(), b"local");
    assert_eq!(std::fs::read(dir.path().join("c.txt")).unwrap(), b"local");
    assert!(!session.ops().iter().any(|op| op.starts_with("read ")));
}

#[tokio::test]
async fn test_overwrite_policy_never_prompts() {
    let session = MockSession::new();
    session.add_file("/src/o.txt", b"remote");
    let session = Arc::new(session);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("o.txt"), b"local").unwrap();

    let ui = Arc::new(MockUi::new());
    let sched = TransferScheduler::with_config(session, ui.clone(), test_config(1));

    let ticket = sched
        .enqueue_download(download_spec(
            "o",
            "/src/o.txt",
            dir.path(),
            ConflictPolicy::Overwrite,
        ))
        .unwrap();
    let outcome = ticket.outcome.await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { .. }));

    assert_eq!(ui.prompt_count(), 0);
    assert_eq!(std::fs::read(dir.path().join("o.txt")).unwrap(), b"remote");
}

#[tokio::test]
async fn test_rename_reservation_yields_distinct_names() {
    // 两个同名远端文件并发下载到同一个目录，
    // 第一个的产物落盘之前第二个就要解决冲突，保留集保证不串名
    let session = MockSession::new().chunk_delay(Duration::from_millis(10));
    session.add_file("/a/f.txt", &[b'A'; 64]);
    session.add_file("/b/f.txt", &[b'B'; 64]);
    let session = Arc::new(session);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), b"original").unwrap();

    let sched = TransferScheduler::with_config(
        session,
        Arc::new(MockUi::new()),
        test_config(2),
    );

    let first = sched
        .enqueue_download(download_spec(
            "a",
            "/a/f.txt",
            dir.path(),
            ConflictPolicy::Rename,
        ))
        .unwrap();
    let second = sched
        .enqueue_download(download_spec(
            "b",
            "/b/f.txt",
            dir.path(),
            ConflictPolicy::Rename,
        ))
        .unwrap();
    first.outcome.await.unwrap().unwrap();
    second.outcome.await.unwrap().unwrap();

    assert_eq!(std::fs::read(dir.path().join("f.txt")).unwrap(), b"original");
    let one = std::fs::read(dir.path().join("f (1).txt")).unwrap();
    let two = std::fs::read(dir.path().join("f (2).txt")).unwrap();
    // 两个任务各占一个候选名，内容互不覆盖
    let mut firsts = vec![one[0], two[0]];
    firsts.sort();
    assert_eq!(firsts, vec![b'A', b'B']);
}
