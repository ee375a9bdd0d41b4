// SwiftGet 无界面下载器
// 用法: swiftget <url> [-o 输出路径] [-n 并发数] [--md5 HEX] [--sha256 HEX]

use std::path::PathBuf;
use std::time::Duration;

use swiftget::config::AppConfig;
use swiftget::downloader::progress::{format_size, SpeedCalculator};
use swiftget::downloader::{DownloadManager, DownloadRequest};
use swiftget::events::DownloadEvent;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 报告器轮询间隔
const REPORT_INTERVAL: Duration = Duration::from_millis(150);

/// 默认配置文件路径
const CONFIG_PATH: &str = "swiftget.json";

struct CliArgs {
    url: String,
    output: Option<PathBuf>,
    connections: Option<usize>,
    md5: Option<String>,
    sha256: Option<String>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut url = None;
    let mut output = None;
    let mut connections = None;
    let mut md5 = None;
    let mut sha256 = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "--output" => {
                output = Some(PathBuf::from(
                    args.next().ok_or("缺少 -o 参数值")?,
                ));
            }
            "-n" | "--connections" => {
                let v = args.next().ok_or("缺少 -n 参数值")?;
                connections = Some(v.parse().map_err(|_| format!("无效的并发数: {}", v))?);
            }
            "--md5" => md5 = Some(args.next().ok_or("缺少 --md5 参数值")?),
            "--sha256" => sha256 = Some(args.next().ok_or("缺少 --sha256 参数值")?),
            "-h" | "--help" => return Err(String::new()),
            other if url.is_none() && !other.starts_with('-') => {
                url = Some(other.to_string());
            }
            other => return Err(format!("未知参数: {}", other)),
        }
    }

    Ok(CliArgs {
        url: url.ok_or("缺少 URL 参数")?,
        output,
        connections,
        md5,
        sha256,
    })
}

fn print_usage() {
    eprintln!(
        "用法: swiftget <url> [选项]\n\
         \n\
         选项:\n\
         \x20 -o, --output <路径>      输出文件或目录 (默认当前目录)\n\
         \x20 -n, --connections <N>    并发连接数 (默认 4, 上限 16)\n\
         \x20     --md5 <HEX>          期望的 MD5 摘要\n\
         \x20     --sha256 <HEX>       期望的 SHA-256 摘要"
    );
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("错误: {}", msg);
            }
            print_usage();
            return 1;
        }
    };

    let config = AppConfig::load_or_default(std::path::Path::new(CONFIG_PATH)).await;
    let _log_guard = swiftget::logging::init_logging(&config.log);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let manager = DownloadManager::new(config.download.max_downloads, event_tx);

    let request = DownloadRequest {
        id: Uuid::new_v4().to_string(),
        url: args.url,
        output_path: args.output.unwrap_or(config.download.download_dir),
        concurrency: args.connections.unwrap_or(config.download.connections),
        expected_md5: args.md5,
        expected_sha256: args.sha256,
    };

    let state = match manager.enqueue(request).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            return 1;
        }
    };

    // 外部报告器：按固定间隔轮询进度状态，核心不会主动推送 Progress
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let mut speed = SpeedCalculator::with_default_window();
    let mut last_downloaded = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.pause_all().await;
                eprintln!("\n已暂停所有下载，退出");
                return 1;
            }
            _ = ticker.tick() => {
                let snap = state.snapshot();
                speed.add_sample(snap.downloaded.saturating_sub(last_downloaded));
                last_downloaded = snap.downloaded;

                if snap.total_size > 0 {
                    let percent = snap.downloaded * 100 / snap.total_size as u64;
                    eprint!(
                        "\r{}% {}/{} ({}/s) 连接数 {}   ",
                        percent,
                        format_size(snap.downloaded),
                        format_size(snap.total_size as u64),
                        format_size(speed.speed()),
                        snap.active_workers,
                    );
                } else if snap.downloaded > 0 {
                    eprint!(
                        "\r{} ({}/s)   ",
                        format_size(snap.downloaded),
                        format_size(speed.speed()),
                    );
                }
            }
            event = event_rx.recv() => match event {
                Some(DownloadEvent::Started { filename, total, .. }) => {
                    if total > 0 {
                        eprintln!("开始下载: {} ({})", filename, format_size(total as u64));
                    } else {
                        eprintln!("开始下载: {} (大小未知)", filename);
                    }
                }
                Some(DownloadEvent::Completed { total, elapsed_ms, .. }) => {
                    let secs = (elapsed_ms as f64 / 1000.0).max(0.001);
                    eprintln!(
                        "\n完成: {} 用时 {:.1}s ({}/s)",
                        format_size(total),
                        secs,
                        format_size((total as f64 / secs) as u64),
                    );
                    return 0;
                }
                Some(DownloadEvent::Error { err, .. }) => {
                    eprintln!("\n下载失败: {}", err);
                    return 1;
                }
                Some(_) => {}
                None => return 1,
            }
        }
    }
}
