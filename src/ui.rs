//! UI 协作方接口
//!
//! 对话框由外部 GUI 层实现，调度器只消费这两个异步入口。

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::conflict::ConflictAction;

/// 冲突对话框的用户选择
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictChoice {
    pub action: ConflictAction,
    /// 勾选"应用到全部"后写入会话记忆，本批次不再弹窗
    pub apply_to_all: bool,
}

/// 模态对话协作方
///
/// 对话框是单一模态表面，同一时刻只能显示一个，
/// 排队逻辑在 [`ConflictResolver`](crate::core::conflict::ConflictResolver) 内。
#[async_trait]
pub trait TransferUi: Send + Sync {
    /// 显示冲突对话框（覆盖/重命名/跳过/取消 + 应用到全部）
    async fn show_conflict_dialog(&self, file_name: &str) -> Result<ConflictChoice>;

    /// 显示保存对话框，用户取消时返回 None
    async fn show_save_dialog(&self, default_name: &str) -> Result<Option<PathBuf>>;
}
