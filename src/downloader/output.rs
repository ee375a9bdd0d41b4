//! 输出文件管理
//!
//! 下载只写入临时文件（`<名字>.<id前缀>.part`，对同一下载 ID 确定，
//! 暂停恢复时复用同一文件），全部字节落盘并通过校验后才原子重命名到
//! 最终路径，最终路径上永远不会出现半成品。
//!
//! 多个工作线程共享同一个文件句柄，使用带偏移的定位写入（pwrite 风格），
//! 不存在共享的 seek 游标，区间互不重叠即可安全并发。

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 共享输出文件
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    /// 创建（或打开已存在的）临时输出文件
    ///
    /// `preallocate` 给定时把文件预分配到该长度，定位写入因此永远不会
    /// 越过文件末尾；恢复下载时文件已是目标长度，不再截断。
    pub fn create(path: &Path, preallocate: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("创建输出目录失败")?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("打开临时文件失败: {:?}", path))?;

        if let Some(total) = preallocate {
            let current = file.metadata().context("读取临时文件元数据失败")?.len();
            if current != total {
                file.set_len(total).context("预分配文件空间失败")?;
                debug!("临时文件预分配完成: {:?}, {} bytes", path, total);
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// 临时文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在指定偏移写入整个缓冲区（定位写入，不移动任何共享游标）
    #[cfg(unix)]
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file
            .write_all_at(buf, offset)
            .with_context(|| format!("定位写入失败: offset={}", offset))
    }

    /// 在指定偏移写入整个缓冲区（定位写入，不移动任何共享游标）
    #[cfg(windows)]
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = self
                .file
                .seek_write(&buf[written..], offset + written as u64)
                .with_context(|| format!("定位写入失败: offset={}", offset))?;
            written += n;
        }
        Ok(())
    }

    /// 清空文件内容
    ///
    /// 顺序下载从 0 重新开始且总大小未知时调用，避免上一轮留下的
    /// 尾部脏数据混进结果。
    pub fn truncate(&self) -> Result<()> {
        self.file.set_len(0).context("清空临时文件失败")
    }

    /// 把数据刷入磁盘
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("刷盘失败")
    }
}

/// 生成确定性的临时文件路径
///
/// 同一下载 ID 每次得到相同路径，暂停恢复时才能续写同一个文件；
/// ID 前缀同时避免了不同下载之间的命名冲突。
pub fn temp_path(dest_dir: &Path, filename: &str, download_id: &str) -> PathBuf {
    let prefix: String = download_id.chars().take(8).collect();
    dest_dir.join(format!("{}.{}.part", filename, prefix))
}

/// 原子地把临时文件移动到最终路径
///
/// 跨设备重命名失败时退化为流式复制再删除源文件。
pub fn promote(tmp: &Path, dest: &Path) -> Result<()> {
    match std::fs::rename(tmp, dest) {
        Ok(()) => {
            info!("✓ 临时文件已重命名到最终路径: {:?}", dest);
            Ok(())
        }
        Err(rename_err) => {
            warn!(
                "重命名失败（可能跨设备），改用复制: {:?} -> {:?}, 原因: {}",
                tmp, dest, rename_err
            );
            std::fs::copy(tmp, dest).context("复制临时文件到最终路径失败")?;
            std::fs::remove_file(tmp).context("删除临时文件失败")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_preallocate_and_positional_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.part");
        let out = OutputFile::create(&path, Some(16)).unwrap();

        // 乱序写入不重叠的区间
        out.write_all_at(8, b"56781234").unwrap();
        out.write_all_at(0, b"abcdefgh").unwrap();
        out.sync().unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content, b"abcdefgh56781234");
    }

    #[test]
    fn test_reopen_keeps_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.part");

        {
            let out = OutputFile::create(&path, Some(8)).unwrap();
            out.write_all_at(0, b"AAAA").unwrap();
        }
        // 重新打开（恢复下载的场景）不截断已有内容
        {
            let out = OutputFile::create(&path, Some(8)).unwrap();
            out.write_all_at(4, b"BBBB").unwrap();
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn test_temp_path_is_deterministic() {
        let dir = Path::new("/tmp/dl");
        let a = temp_path(dir, "file.bin", "0123456789abcdef");
        let b = temp_path(dir, "file.bin", "0123456789abcdef");
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/tmp/dl/file.bin.01234567.part"));

        // 不同下载 ID 互不冲突
        let c = temp_path(dir, "file.bin", "fedcba9876543210");
        assert_ne!(a, c);
    }

    #[test]
    fn test_promote_renames() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("a.part");
        let dest = dir.path().join("a.bin");
        std::fs::write(&tmp, b"payload").unwrap();

        promote(&tmp, &dest).unwrap();

        assert!(!tmp.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
