//! 日志模块 - 文件日志与大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件大小上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(section) = config.get("log") {
                        if let Ok(log) = serde_json::from_value::<LogConfig>(section.clone()) {
                            return log;
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 保存日志配置，保留文件中的其他段
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");

        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["log"] = serde_json::to_value(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let content = serde_json::to_string_pretty(&config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&config_file, content)
    }

    /// 配置的日志级别对应的 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct RotState {
    writer: BufWriter<File>,
    /// 当前文件已写入的字节数，避免每次写都 stat 文件
    written: u64,
}

/// 按大小轮转的日志写入器，超限时把当前文件挪到 app.log.old
#[derive(Clone)]
pub struct RotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    state: Arc<Mutex<RotState>>,
}

impl RotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let written = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        let writer = Self::open_append(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            state: Arc::new(Mutex::new(RotState { writer, written })),
        })
    }

    fn open_append(file_path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        Ok(BufWriter::new(file))
    }

    /// 当前文件挪为 .old，旧备份直接覆盖
    fn rotate(&self, state: &mut RotState) -> io::Result<()> {
        let _ = state.writer.flush();
        let backup = self.file_path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.file_path, &backup)?;
        state.writer = Self::open_append(&self.file_path)?;
        state.written = 0;
        Ok(())
    }
}

/// 指向共享状态的写入句柄，tracing 每条日志取一个
pub struct LogWriter {
    shared: RotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock().unwrap();
        // 写之前轮转，保证整条日志落在同一个文件里
        if state.written > 0 && state.written + buf.len() as u64 > self.shared.max_size {
            // 轮转失败不应该打断日志写入
            let _ = self.shared.rotate(&mut state);
        }
        let n = state.writer.write(buf)?;
        state.writer.flush()?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.state.lock().unwrap().writer.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            shared: self.clone(),
        }
    }
}

/// 日志目录路径（应用配置目录下的 logs）
pub fn get_log_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("transtools"))
        .unwrap_or_else(|| PathBuf::from(".transtools"))
        .join("logs")
}

/// 初始化全局日志
///
/// 文件日志始终开启（除非配置禁用），debug 构建额外输出到控制台。
/// 重复调用是无害的，后续调用设置全局 subscriber 会失败并被忽略。
pub fn init_logging(config: &LogConfig) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    let log_dir = get_log_dir();
    match RotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);
                let _ = tracing::subscriber::set_global_default(
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(file_layer)
                        .with(console_layer),
                );
            }

            #[cfg(not(debug_assertions))]
            {
                let _ = tracing::subscriber::set_global_default(
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(file_layer),
                );
            }
        }
        Err(e) => {
            // 文件日志建不起来就退回控制台
            eprintln!("创建日志文件失败: {} - {}", log_dir.display(), e);
            let _ = tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().with_target(false)),
            );
        }
    }
}
