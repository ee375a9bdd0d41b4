//! 日志系统配置
//!
//! 控制台与文件双输出：文件按大小滚动（文件名带启动时间戳），
//! 启动时清理超过保留天数的旧日志。

use crate::config::LogConfig;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "swiftget";

/// 时间戳格式
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志写入器
///
/// 文件名形如 `swiftget.2024-01-01-120000.log`，写满后切换到
/// `swiftget.2024-01-01-120000_1.log`、`_2.log`……
struct RollingWriterInner {
    log_dir: PathBuf,
    start_timestamp: String,
    max_file_size: u64,
    current: Option<File>,
    current_index: u32,
    current_size: u64,
}

impl RollingWriterInner {
    fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut inner = Self {
            log_dir,
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            max_file_size,
            current: None,
            current_index: 0,
            current_size: 0,
        };
        inner.open_next(false)?;
        Ok(inner)
    }

    fn file_path(&self) -> PathBuf {
        let name = if self.current_index == 0 {
            format!("{}.{}.log", LOG_PREFIX, self.start_timestamp)
        } else {
            format!(
                "{}.{}_{}.log",
                LOG_PREFIX, self.start_timestamp, self.current_index
            )
        };
        self.log_dir.join(name)
    }

    fn open_next(&mut self, rotate: bool) -> io::Result<()> {
        if rotate {
            if let Some(mut file) = self.current.take() {
                file.flush()?;
            }
            self.current_index += 1;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?;
        self.current = Some(file);
        self.current_size = 0;
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_file_size {
            self.open_next(true)?;
        }
        let file = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件未打开"))?;
        let written = file.write(buf)?;
        self.current_size += written as u64;
        Ok(written)
    }
}

/// 线程安全的滚动写入器，实现 `Write` 供 tracing 使用
pub struct RollingWriter {
    inner: Arc<Mutex<RollingWriterInner>>,
}

impl RollingWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingWriterInner::new(log_dir, max_file_size)?)),
        })
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.inner.lock().unwrap().current.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Clone for RollingWriter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// 日志系统守卫，必须保持存活否则文件写入线程终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(io::stderr)
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RollingWriter::new(config.log_dir.clone(), config.max_file_size));
    let writer = match writer {
        Ok(w) => w,
        Err(e) => {
            eprintln!("初始化日志文件失败，仅输出到控制台: {}", e);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理超过保留天数的日志文件
///
/// 文件名形如 `swiftget.YYYY-MM-DD-HHMMSS[_N].log`，按其中的日期判断；
/// 解析不出日期的按文件修改时间兜底。
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut deleted = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(".log") || !path.is_file() {
            continue;
        }

        let expired = match file_date(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| {
                    let age = chrono::Utc::now()
                        .signed_duration_since(chrono::DateTime::<chrono::Utc>::from(modified));
                    age > retention
                })
                .unwrap_or(false),
        };

        if expired && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
}

/// 从文件名 `swiftget.YYYY-MM-DD-HHMMSS[_N].log` 中提取日期
fn file_date(filename: &str) -> Option<chrono::NaiveDate> {
    let rest = filename
        .strip_prefix(LOG_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    let date_part: String = rest.splitn(4, '-').take(3).collect::<Vec<_>>().join("-");
    chrono::NaiveDate::parse_from_str(&date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_date_extraction() {
        assert_eq!(
            file_date("swiftget.2024-03-15-093000.log"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            file_date("swiftget.2024-03-15-093000_2.log"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(file_date("other.log"), None);
    }

    #[test]
    fn test_rolling_writer_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path().to_path_buf(), 64).unwrap();

        // 两次写入超过 64 字节上限，触发滚动
        writer.write_all(&[b'a'; 48]).unwrap();
        writer.write_all(&[b'b'; 48]).unwrap();
        writer.flush().unwrap();

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }
}
