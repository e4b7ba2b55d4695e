//! 目录树收集器
//!
//! 把本地或远端目录树展平成有序条目列表：目录先于其所有后代出现，
//! 子项按名称排序保证可重复，相对路径在任何宿主系统上都使用 / 分隔。
//! 任意一次子目录列取失败都会使整个收集失败，不返回部分结构。

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use walkdir::WalkDir;

use crate::core::job::AbortController;
use crate::session::{join_remote, RemoteSession};

/// 文件条目
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub relative_path: String,
    pub size: u64,
}

/// 目录条目
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub relative_path: String,
}

/// 收集结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedEntries {
    pub dirs: Vec<DirEntry>,
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
    pub total_files: u32,
}

impl CollectedEntries {
    fn push_dir(&mut self, relative_path: String) {
        self.dirs.push(DirEntry { relative_path });
    }

    fn push_file(&mut self, relative_path: String, size: u64) {
        self.total_bytes += size;
        self.total_files += 1;
        self.files.push(FileEntry {
            relative_path,
            size,
        });
    }
}

/// 统一路径分隔符
fn normalize_separators(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// 深度优先收集本地目录树
pub async fn collect_local(
    root: &Path,
    abort: AbortController,
) -> Result<CollectedEntries> {
    let root = root.to_path_buf();
    // walkdir 是阻塞遍历，放到 blocking 线程避免卡住 runtime
    tokio::task::spawn_blocking(move || {
        let mut out = CollectedEntries::default();
        let mut seen = 0usize;
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            seen += 1;
            if seen % 64 == 0 && abort.is_aborted() {
                anyhow::bail!("收集已中止");
            }

            let entry = entry.with_context(|| format!("遍历目录失败: {}", root.display()))?;
            let rel = entry
                .path()
                .strip_prefix(&root)
                .with_context(|| format!("计算相对路径失败: {}", entry.path().display()))?;
            if rel.as_os_str().is_empty() {
                // 根目录本身不入列表
                continue;
            }

            let meta = entry
                .metadata()
                .with_context(|| format!("读取元数据失败: {}", entry.path().display()))?;
            let rel = normalize_separators(rel);
            if meta.is_dir() {
                out.push_dir(rel);
            } else if meta.is_file() {
                out.push_file(rel, meta.len());
            }
        }
        Ok(out)
    })
    .await
    .context("收集任务 join 失败")?
}

/// 深度优先收集远端目录树
///
/// 用显式栈代替异步递归；访问某个目录时先记录其子目录，
/// 再按名称序逆向压栈，保证出栈顺序就是深度优先的名称序。
pub async fn collect_remote(
    session: &dyn RemoteSession,
    root: &str,
    abort: &AbortController,
) -> Result<CollectedEntries> {
    let mut out = CollectedEntries::default();
    // 相对目录路径，空串表示根
    let mut stack: Vec<String> = vec![String::new()];

    while let Some(rel_dir) = stack.pop() {
        if abort.is_aborted() {
            anyhow::bail!("收集已中止");
        }

        let abs = join_remote(root, &rel_dir);
        let mut entries = session
            .list(&abs)
            .await
            .with_context(|| format!("列取远端目录失败: {}", abs))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut subdirs = Vec::new();
        for entry in entries {
            let rel = if rel_dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", rel_dir, entry.name)
            };
            if entry.is_dir {
                out.push_dir(rel.clone());
                subdirs.push(rel);
            } else {
                out.push_file(rel, entry.size);
            }
        }
        // 逆向压栈，名称序小的先被处理
        for sub in subdirs.into_iter().rev() {
            stack.push(sub);
        }
    }

    tracing::debug!(
        "远端收集完成: {}: {} 个目录, {} 个文件, {} 字节",
        root,
        out.dirs.len(),
        out.total_files,
        out.total_bytes
    );
    Ok(out)
}
