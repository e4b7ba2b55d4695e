//! 远程会话抽象接口
//!
//! FTP/SFTP 的连接、认证与线路协议由外部会话对象实现，
//! 调度器只通过本模块的 trait 与其交互。

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 远程读取返回的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 远程目录条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified_time: i64,
}

/// 远程文件元数据
#[derive(Debug, Clone)]
pub struct RemoteMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 单条活动连接上的会话操作
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// 列出目录的直接子项
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// 获取路径元数据，不存在返回 None
    async fn stat(&self, path: &str) -> Result<Option<RemoteMeta>>;

    /// 打开远程文件的读取流
    async fn open_read(&self, path: &str) -> Result<ByteStream>;

    /// 把字节流写入远程文件
    async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        total_size: Option<u64>,
    ) -> Result<()>;

    /// 创建远程目录
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// 删除远程文件
    async fn delete(&self, path: &str) -> Result<()>;

    /// 删除远程目录
    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<()>;

    /// 会话名称（用于日志）
    fn name(&self) -> &str;
}

/// 会话独占操作门闩
///
/// 冲突探测与传输共用同一条控制通道，临时的独占操作
/// （例如预览抓取）必须先声明占用，重叠的独占请求被拒绝
/// 而不是在控制通道上交错协议命令。
#[derive(Debug, Default)]
pub struct SessionGuard {
    busy: Arc<AtomicBool>,
}

/// 独占操作的 RAII 凭据，Drop 时释放占用
pub struct ExclusiveOp {
    flag: Arc<AtomicBool>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试进入独占区，已被占用时立即失败
    pub fn try_exclusive(&self) -> Result<ExclusiveOp> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(ExclusiveOp {
                flag: self.busy.clone(),
            })
        } else {
            Err(anyhow::anyhow!("会话正被独占操作占用"))
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for ExclusiveOp {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// 拼接远程路径（统一使用 / 分隔符）
pub fn join_remote(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    if rel.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else if base.is_empty() {
        format!("/{}", rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

/// 取远程路径的最后一段
pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}
