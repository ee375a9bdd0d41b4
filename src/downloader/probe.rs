//! HTTP 探测
//!
//! 对资源发起一次 GET（不用 HEAD，部分服务器对 HEAD 处理有问题），
//! 只根据响应头判定总大小、Range 支持情况和服务器端摘要；随后最多读取
//! 512 字节响应体头部供文件名嗅探使用。探测连接不会被浪费：引擎退化到
//! 单连接路径时，已读的头部字节和剩余响应体直接作为下载数据消费。

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode, Url};
use tracing::{debug, info};

use crate::downloader::filename::SNIFF_LEN;

/// 浏览器样式的 User-Agent，避免被部分站点拦截
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) \
Chrome/120.0.0.0 Safari/537.36";

/// 等待响应头的超时；整个下载不设总超时
pub const HEADER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// 服务器声明 SHA-256 摘要的自定义头
const CHECKSUM_SHA256_HEADER: &str = "x-checksum-sha256";

/// 从响应头解析出的探测信息
#[derive(Debug, Clone)]
pub struct ProbeHeaders {
    /// Content-Length，缺失或分块传输时为 -1
    pub total_size: i64,
    /// 是否可以发起 Range 续传请求
    pub ranges_supported: bool,
    /// 服务器 Content-MD5
    pub server_md5: Option<String>,
    /// 服务器 X-Checksum-SHA256
    pub server_sha256: Option<String>,
    /// ETag（记录备用，恢复时校验资源未变更）
    pub etag: Option<String>,
    /// Last-Modified（记录备用）
    pub last_modified: Option<String>,
    /// Content-Disposition 原始值
    pub content_disposition: Option<String>,
}

/// 探测结果
///
/// 持有仍然存活的响应：`head` 是已读的响应体头部，单连接路径把它写入
/// 文件后继续消费 `response` 的剩余字节。
pub struct ProbeResult {
    pub headers: ProbeHeaders,
    /// 已读的响应体头部（最多约 512 字节）
    pub head: Vec<u8>,
    /// 跟随重定向后的最终 URL
    pub final_url: Url,
    /// 探测用的响应体，头部之后的字节尚未读取
    pub response: Response,
}

/// 纯头部解析，便于单测
pub fn parse_probe_headers(status: StatusCode, headers: &HeaderMap) -> ProbeHeaders {
    let total_size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(-1);

    // 仅当服务器显式声明 Accept-Ranges: bytes 且状态码允许续传时才分片
    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let ranges_supported = accept_ranges == "bytes"
        && (status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT);

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    ProbeHeaders {
        total_size,
        ranges_supported,
        server_md5: header_str("content-md5"),
        server_sha256: header_str(CHECKSUM_SHA256_HEADER),
        etag: headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        last_modified: headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        content_disposition: headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

/// 探测资源
///
/// 非 2xx 状态码为致命错误。
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult> {
    debug!("开始探测资源: {}", url);

    let mut response = tokio::time::timeout(HEADER_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| anyhow::anyhow!("探测超时: {}s 内未收到响应头", HEADER_TIMEOUT.as_secs()))?
        .with_context(|| format!("探测请求失败: {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("探测失败: 服务器返回状态码 {}", status);
    }

    let headers = parse_probe_headers(status, response.headers());
    let final_url = response.url().clone();

    // 读取最多 512 字节响应体头部，供文件名嗅探与单连接路径复用
    let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
    while head.len() < SNIFF_LEN {
        match response.chunk().await.context("读取探测响应体失败")? {
            Some(bytes) => head.extend_from_slice(&bytes),
            None => break,
        }
    }

    info!(
        "探测完成: 状态={}, 总大小={}, Range支持={}, ETag={:?}",
        status, headers.total_size, headers.ranges_supported, headers.etag
    );

    Ok(ProbeResult {
        headers,
        head,
        final_url,
        response,
    })
}

/// 构建下载专用的 HTTP 客户端
///
/// 不设置整体超时（下载可能持续很久），连接超时 30 秒；
/// 分块读取的超时由调用方按块控制。
pub fn build_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(std::time::Duration::from_secs(30))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .tcp_nodelay(true)
        .pool_max_idle_per_host(32)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("构建 HTTP 客户端失败")
}
