//! 应用配置模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::core::scheduler::{MAX_CONCURRENCY, MIN_CONCURRENCY};

/// 传输调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 最大并发传输数，有效区间 1-10
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 进度节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 重命名占位的存活时间（秒）
    #[serde(default = "default_reserve_ttl_secs")]
    pub reserve_ttl_secs: u64,
}

fn default_max_concurrency() -> usize {
    2
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_reserve_ttl_secs() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            progress_interval_ms: default_progress_interval_ms(),
            reserve_ttl_secs: default_reserve_ttl_secs(),
        }
    }
}

impl TransferConfig {
    /// 配置值可能来自手改的文件，使用前收拢到有效区间
    pub fn clamped_concurrency(&self) -> usize {
        self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// 从配置文件加载传输配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(section) = config.get("transfer") {
                        if let Ok(transfer) =
                            serde_json::from_value::<TransferConfig>(section.clone())
                        {
                            return transfer;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存传输配置，保留文件中的其他段
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");

        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["transfer"] = serde_json::to_value(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let content = serde_json::to_string_pretty(&config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&config_file, content)?;

        Ok(())
    }
}
