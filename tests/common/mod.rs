//! 集成测试共用的内存会话与脚本化 UI
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use transtools::session::{ByteStream, RemoteEntry, RemoteMeta, RemoteSession};
use transtools::ui::{ConflictChoice, TransferUi};

/// 内存远端，路径一律以 / 开头、/ 分隔
pub struct MockSession {
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashSet<String>>,
    /// 读取流的分块大小
    chunk_size: usize,
    /// 每块之间的人为延迟，用来制造传输重叠
    chunk_delay: Duration,
    inflight: Arc<AtomicUsize>,
    max_inflight: Arc<AtomicUsize>,
    ops: Mutex<Vec<String>>,
}

struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn enter(inflight: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self {
            inflight: inflight.clone(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashSet::from(["/".to_string()])),
            chunk_size: 8,
            chunk_delay: Duration::from_millis(0),
            inflight: Arc::new(AtomicUsize::new(0)),
            max_inflight: Arc::new(AtomicUsize::new(0)),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.add_dir(path);
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.add_file(path, content);
        self
    }

    pub fn add_dir(&self, path: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            dirs.insert(cur.clone());
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        if let Some(pos) = path.rfind('/') {
            if pos > 0 {
                self.add_dir(&path[..pos]);
            }
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::SeqCst)
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    /// base 的直接子名，entry 为相对名
    fn direct_child(base: &str, path: &str) -> Option<String> {
        let prefix = if base == "/" {
            "/".to_string()
        } else {
            format!("{}/", base)
        };
        let rest = path.strip_prefix(&prefix)?;
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.record(format!("list {}", path));
        let base = if path == "/" {
            "/".to_string()
        } else {
            path.trim_end_matches('/').to_string()
        };
        if !self.dirs.lock().unwrap().contains(&base) {
            anyhow::bail!("目录不存在: {}", base);
        }

        let mut entries = Vec::new();
        for (p, content) in self.files.lock().unwrap().iter() {
            if let Some(name) = Self::direct_child(&base, p) {
                entries.push(RemoteEntry {
                    name,
                    size: content.len() as u64,
                    is_dir: false,
                    modified_time: 0,
                });
            }
        }
        for d in self.dirs.lock().unwrap().iter() {
            if let Some(name) = Self::direct_child(&base, d) {
                entries.push(RemoteEntry {
                    name,
                    size: 0,
                    is_dir: true,
                    modified_time: 0,
                });
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>> {
        if let Some(content) = self.files.lock().unwrap().get(path) {
            return Ok(Some(RemoteMeta {
                size: content.len() as u64,
                modified_time: 0,
                is_dir: false,
            }));
        }
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(Some(RemoteMeta {
                size: 0,
                modified_time: 0,
                is_dir: true,
            }));
        }
        Ok(None)
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        self.record(format!("read {}", path));
        let content = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("文件不存在: {}", path))?;

        let guard = InflightGuard::enter(&self.inflight, &self.max_inflight);
        let chunk_size = self.chunk_size.max(1);
        let delay = self.chunk_delay;

        struct ReadState {
            content: Vec<u8>,
            pos: usize,
            chunk_size: usize,
            delay: Duration,
            _guard: InflightGuard,
        }
        let state = ReadState {
            content,
            pos: 0,
            chunk_size,
            delay,
            _guard: guard,
        };
        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.pos >= st.content.len() {
                return None;
            }
            tokio::time::sleep(st.delay).await;
            let end = (st.pos + st.chunk_size).min(st.content.len());
            let chunk = Bytes::copy_from_slice(&st.content[st.pos..end]);
            st.pos = end;
            Some((Ok(chunk), st))
        });
        Ok(Box::pin(stream))
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _total_size: Option<u64>,
    ) -> Result<()> {
        self.record(format!("write {}", path));
        let _guard = InflightGuard::enter(&self.inflight, &self.max_inflight);

        // 源流提前收束时写入的是部分内容，和真实远端一致
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::time::sleep(self.chunk_delay).await;
            buf.extend_from_slice(&chunk);
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), buf.clone());
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        self.record(format!("mkdir {}", path));
        if recursive {
            self.add_dir(path);
        } else {
            self.dirs.lock().unwrap().insert(path.to_string());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.record(format!("delete {}", path));
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<()> {
        self.record(format!("rmdir {}", path));
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.dirs.lock().unwrap().remove(path);
        if recursive {
            self.dirs.lock().unwrap().retain(|d| !d.starts_with(&prefix));
            self.files.lock().unwrap().retain(|f, _| !f.starts_with(&prefix));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 脚本化对话框，按顺序吐出预置的选择
pub struct MockUi {
    conflict_choices: Mutex<VecDeque<ConflictChoice>>,
    save_paths: Mutex<VecDeque<Option<PathBuf>>>,
    prompts: AtomicUsize,
    /// 弹出冲突对话框后永不返回，模拟用户一直不操作
    hold_conflict: bool,
}

impl MockUi {
    pub fn new() -> Self {
        Self {
            conflict_choices: Mutex::new(VecDeque::new()),
            save_paths: Mutex::new(VecDeque::new()),
            prompts: AtomicUsize::new(0),
            hold_conflict: false,
        }
    }

    pub fn hold_conflict_dialog(mut self) -> Self {
        self.hold_conflict = true;
        self
    }

    pub fn with_conflict_choice(self, choice: ConflictChoice) -> Self {
        self.conflict_choices.lock().unwrap().push_back(choice);
        self
    }

    pub fn with_save_path(self, path: Option<PathBuf>) -> Self {
        self.save_paths.lock().unwrap().push_back(path);
        self
    }

    /// 冲突对话框被实际弹出的次数
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferUi for MockUi {
    async fn show_conflict_dialog(&self, _file_name: &str) -> Result<ConflictChoice> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.hold_conflict {
            std::future::pending::<()>().await;
        }
        self.conflict_choices
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("冲突对话框没有预置选择"))
    }

    async fn show_save_dialog(&self, _default_name: &str) -> Result<Option<PathBuf>> {
        self.save_paths
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("保存对话框没有预置路径"))
    }
}
