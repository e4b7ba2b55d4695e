//! 冲突解决器
//!
//! 决策顺序：会话记忆 → 非交互全局策略 → 排队弹窗。
//! 弹窗是单一模态表面，跨任务串行；等待弹窗只阻塞提问的任务本身。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::job::ConflictPolicy;
use crate::ui::TransferUi;

/// 冲突处理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Overwrite,
    Rename,
    Skip,
    /// 用户关闭/取消了对话框
    CancelDialog,
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictAction::Overwrite => write!(f, "overwrite"),
            ConflictAction::Rename => write!(f, "rename"),
            ConflictAction::Skip => write!(f, "skip"),
            ConflictAction::CancelDialog => write!(f, "cancel_dialog"),
        }
    }
}

impl From<&str> for ConflictAction {
    fn from(s: &str) -> Self {
        match s {
            "overwrite" => ConflictAction::Overwrite,
            "rename" => ConflictAction::Rename,
            "cancel_dialog" => ConflictAction::CancelDialog,
            _ => ConflictAction::Skip,
        }
    }
}

/// 解决结果
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub action: ConflictAction,
    /// Rename 时为新生成的名字，其余情况为原名
    pub final_name: String,
    /// 命中会话记忆，未经弹窗
    pub from_memory: bool,
}

/// 冲突解决器
///
/// 会话记忆与重命名保留集都以连接为生命周期，
/// 连接拆除时由调度器调用 [`reset_session`](Self::reset_session) 清空。
pub struct ConflictResolver {
    ui: Arc<dyn TransferUi>,
    /// "应用到全部"记忆：首次勾选后缓存动作，本批次复用
    memory: Mutex<Option<ConflictAction>>,
    /// 重命名保留集：候选名 → 保留时刻，限时窗口内视为已占用
    reservations: Mutex<HashMap<String, Instant>>,
    reserve_ttl: Duration,
    /// 弹窗串行化；持锁跨越对话等待
    prompt_lock: tokio::sync::Mutex<()>,
}

impl ConflictResolver {
    pub fn new(ui: Arc<dyn TransferUi>, reserve_ttl: Duration) -> Self {
        Self {
            ui,
            memory: Mutex::new(None),
            reservations: Mutex::new(HashMap::new()),
            reserve_ttl,
            prompt_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 解决一次目标名冲突
    ///
    /// `existing` 是目标目录当前已存在的名字集合，由执行器提供，
    /// 解决器本身不做 I/O。
    pub async fn resolve(
        &self,
        file_name: &str,
        existing: &HashSet<String>,
        policy: ConflictPolicy,
        apply_to_all: bool,
    ) -> Result<ResolvedConflict> {
        // 1. 会话记忆优先，不再弹窗
        if let Some(action) = *self.memory.lock().unwrap() {
            debug!("冲突命中会话记忆: {} -> {}", file_name, action);
            return Ok(self.apply_action(action, file_name, existing, true));
        }

        // 2. 非交互全局策略
        let action = match policy {
            ConflictPolicy::Overwrite => Some(ConflictAction::Overwrite),
            ConflictPolicy::Rename => Some(ConflictAction::Rename),
            ConflictPolicy::Skip => Some(ConflictAction::Skip),
            ConflictPolicy::Prompt => None,
        };
        if let Some(action) = action {
            if apply_to_all {
                *self.memory.lock().unwrap() = Some(action);
            }
            return Ok(self.apply_action(action, file_name, existing, false));
        }

        // 3. 排队弹窗，一次只显示一个
        let _guard = self.prompt_lock.lock().await;

        // 排队期间其他任务可能已写入记忆
        if let Some(action) = *self.memory.lock().unwrap() {
            debug!("排队等待期间记忆生效: {} -> {}", file_name, action);
            return Ok(self.apply_action(action, file_name, existing, true));
        }

        let choice = self.ui.show_conflict_dialog(file_name).await?;
        if choice.apply_to_all && choice.action != ConflictAction::CancelDialog {
            *self.memory.lock().unwrap() = Some(choice.action);
        }
        Ok(self.apply_action(choice.action, file_name, existing, false))
    }

    fn apply_action(
        &self,
        action: ConflictAction,
        file_name: &str,
        existing: &HashSet<String>,
        from_memory: bool,
    ) -> ResolvedConflict {
        let final_name = match action {
            ConflictAction::Rename => self.reserve_unique_name(file_name, existing),
            _ => file_name.to_string(),
        };
        ResolvedConflict {
            action,
            final_name,
            from_memory,
        }
    }

    /// 生成并保留一个唯一的候选名
    ///
    /// 候选名既不能出现在目标列表里，也不能命中其他任务
    /// 在限时窗口内保留的名字。
    fn reserve_unique_name(&self, file_name: &str, existing: &HashSet<String>) -> String {
        let mut reservations = self.reservations.lock().unwrap();
        reservations.retain(|_, at| at.elapsed() < self.reserve_ttl);

        let name = next_available_name(file_name, |candidate| {
            existing.contains(candidate) || reservations.contains_key(candidate)
        });
        reservations.insert(name.clone(), Instant::now());
        debug!("重命名保留: {} -> {}", file_name, name);
        name
    }

    /// 清空会话级状态（连接拆除时调用）
    pub fn reset_session(&self) {
        *self.memory.lock().unwrap() = None;
        self.reservations.lock().unwrap().clear();
    }

    /// 当前记忆的动作（诊断用）
    pub fn remembered(&self) -> Option<ConflictAction> {
        *self.memory.lock().unwrap()
    }
}

/// 在扩展名前追加 " (n)" 直到名字可用
pub fn next_available_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    let (stem, ext) = split_name(name);
    let mut n = 1u32;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// 在最后一个 . 处拆分主名与扩展名；点开头的隐藏文件不拆
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}
