//! 下载完整性校验
//!
//! 按优先级依次取第一个可用的期望摘要（用户 MD5 > 用户 SHA-256 >
//! 服务器 Content-MD5 > 服务器 X-Checksum-SHA256），从文件头开始流式
//! 计算对应哈希并比对十六进制值。不匹配为终结性错误；没有任何期望
//! 摘要时静默通过。

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// 流式读取的缓冲区大小
const HASH_BUF_SIZE: usize = 64 * 1024;

/// 期望摘要集合
#[derive(Debug, Clone, Default)]
pub struct ExpectedDigests {
    /// 用户提供的 MD5
    pub user_md5: Option<String>,
    /// 用户提供的 SHA-256
    pub user_sha256: Option<String>,
    /// 服务器 Content-MD5 头
    pub server_md5: Option<String>,
    /// 服务器 X-Checksum-SHA256 头
    pub server_sha256: Option<String>,
}

impl ExpectedDigests {
    /// 是否存在任何期望摘要
    pub fn is_empty(&self) -> bool {
        self.user_md5.is_none()
            && self.user_sha256.is_none()
            && self.server_md5.is_none()
            && self.server_sha256.is_none()
    }
}

/// 哈希算法种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashKind {
    Md5,
    Sha256,
}

impl HashKind {
    fn name(self) -> &'static str {
        match self {
            HashKind::Md5 => "MD5",
            HashKind::Sha256 => "SHA-256",
        }
    }
}

/// 校验文件摘要
///
/// 只检查优先级最高的那一个期望值，匹配返回 Ok，不匹配返回错误。
pub async fn verify_file(path: &Path, digests: &ExpectedDigests) -> Result<()> {
    let (kind, expected) = if let Some(v) = &digests.user_md5 {
        (HashKind::Md5, v)
    } else if let Some(v) = &digests.user_sha256 {
        (HashKind::Sha256, v)
    } else if let Some(v) = &digests.server_md5 {
        (HashKind::Md5, v)
    } else if let Some(v) = &digests.server_sha256 {
        (HashKind::Sha256, v)
    } else {
        debug!("未提供任何期望摘要，跳过完整性校验");
        return Ok(());
    };

    let actual = match kind {
        HashKind::Md5 => file_md5(path).await?,
        HashKind::Sha256 => file_sha256(path).await?,
    };

    let expected_lower = expected.trim().to_ascii_lowercase();
    if actual != expected_lower {
        anyhow::bail!(
            "{} 摘要不匹配: 期望 {}, 实际 {}",
            kind.name(),
            expected_lower,
            actual
        );
    }

    info!("✓ {} 完整性校验通过: {:?}", kind.name(), path);
    Ok(())
}

/// 流式计算文件 MD5（小写十六进制）
pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.context("打开文件计算 MD5 失败")?;
    let mut hasher = Md5Context::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await.context("读取文件失败")?;
        if n == 0 {
            break;
        }
        hasher.consume(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.compute()))
}

/// 流式计算文件 SHA-256（小写十六进制）
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.context("打开文件计算 SHA-256 失败")?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await.context("读取文件失败")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
