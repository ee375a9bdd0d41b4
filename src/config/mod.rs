// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    pub download_dir: PathBuf,
    /// 最大同时下载文件数
    pub max_downloads: usize,
    /// 单个下载的默认并发连接数
    pub connections: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            max_downloads: 3,
            connections: 4,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否输出到文件
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 保留天数
    pub retention_days: u32,
    /// 日志级别
    pub level: String,
    /// 单个日志文件最大大小（字节）
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: "info".to_string(),
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    /// 从 JSON 文件加载配置
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        serde_json::from_str(&content).context("解析配置文件失败")
    }

    /// 加载配置，文件不存在或解析失败时回退到默认值
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    warn!("加载配置失败，使用默认配置: {:#}", e);
                }
                Self::default()
            }
        }
    }

    /// 保存配置到 JSON 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.context("创建配置目录失败")?;
            }
        }
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.max_downloads, 3);
        assert_eq!(config.download.connections, 4);
        assert_eq!(config.log.retention_days, 7);
        assert_eq!(config.log.level, "info");
        assert!(!config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.download.max_downloads = 5;
        config.download.connections = 8;
        config.save(&path).await.unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.download.max_downloads, 5);
        assert_eq!(loaded.download.connections, 8);
    }

    #[tokio::test]
    async fn test_load_or_default_on_missing_file() {
        let config = AppConfig::load_or_default(Path::new("/nonexistent/config.json")).await;
        assert_eq!(config.download.max_downloads, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        // 只给 download 段，log 段用默认值
        let config: AppConfig =
            serde_json::from_str(r#"{"download":{"download_dir":"/d","max_downloads":1,"connections":2}}"#)
                .unwrap();
        assert_eq!(config.download.max_downloads, 1);
        assert_eq!(config.log.retention_days, 7);
    }
}
