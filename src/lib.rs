// SwiftGet
// 多连接 HTTP 下载引擎核心库

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 事件流模块
pub mod events;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    DownloadEngine, DownloadManager, DownloadRequest, ProgressSnapshot, ProgressState,
};
pub use events::{DownloadEvent, EventPriority, EventReceiver, EventSender};
