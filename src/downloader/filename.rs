//! 输出文件名解析
//!
//! 按优先级确定落盘文件名：
//! 1. `Content-Disposition` 的 filename 参数（RFC 6266，含 RFC 5987 扩展形式）
//! 2. ZIP 本地文件头里的内部文件名（响应体以 `50 4B 03 04` 开头时）
//! 3. URL 路径最后一段（百分号解码后）
//! 4. 兜底 `download.bin`
//!
//! 文件名缺少扩展名时根据嗅探到的魔数补全，最终结果一律消毒为安全的
//! 纯文件名（不含目录成分）。

use percent_encoding::percent_decode_str;
use reqwest::Url;
use tracing::debug;

/// 兜底文件名
pub const DEFAULT_FILENAME: &str = "download.bin";

/// 魔数嗅探最多使用的头部字节数
pub const SNIFF_LEN: usize = 512;

/// 文件名中需要替换的非法字符
const ILLEGAL_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// 固定魔数表：(前缀, 扩展名)
const MAGIC_TABLE: &[(&[u8], &str)] = &[
    (b"\xFF\xD8\xFF", "jpg"),
    (b"\x89PNG\r\n\x1a\n", "png"),
    (b"GIF87a", "gif"),
    (b"GIF89a", "gif"),
    (b"%PDF", "pdf"),
    (b"PK\x03\x04", "zip"),
    (b"\x1f\x8b", "gz"),
    (b"BZh", "bz2"),
    (b"\xFD7zXZ\x00", "xz"),
    (b"7z\xBC\xAF\x27\x1C", "7z"),
    (b"Rar!\x1a\x07", "rar"),
    (b"OggS", "ogg"),
    (b"ID3", "mp3"),
    (b"\x00\x00\x01\x00", "ico"),
    (b"BM", "bmp"),
];

/// 解析输出文件名
///
/// `head` 为探测阶段读到的响应体头部（最多 512 字节参与嗅探）。
pub fn resolve_filename(url: &Url, content_disposition: Option<&str>, head: &[u8]) -> String {
    let head = &head[..head.len().min(SNIFF_LEN)];

    let mut filename = content_disposition
        .and_then(from_content_disposition)
        .or_else(|| from_zip_header(head))
        .or_else(|| from_url_path(url))
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    // 没有扩展名时按魔数补全
    if !filename.contains('.') {
        if let Some(ext) = infer_extension(head) {
            debug!("根据魔数补全扩展名: {} -> .{}", filename, ext);
            filename = format!("{}.{}", filename, ext);
        }
    }

    sanitize_filename(&filename)
}

/// 从 `Content-Disposition` 头解析 filename
///
/// 优先 RFC 5987 的 `filename*=charset''percent-encoded`，其次普通 `filename=`。
fn from_content_disposition(cd: &str) -> Option<String> {
    let lower = cd.to_ascii_lowercase();

    if let Some(i) = lower.find("filename*=") {
        let v = cd[i + "filename*=".len()..].trim();
        let v = v.split(';').next().unwrap_or(v).trim().trim_matches('"');
        // 形如 UTF-8''hello%20world.bin
        let encoded = match v.find("''") {
            Some(pos) => &v[pos + 2..],
            None => v,
        };
        if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
            let name = base_name(decoded.trim());
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    if let Some(i) = lower.find("filename=") {
        let v = cd[i + "filename=".len()..].trim();
        let v = v.split(';').next().unwrap_or(v).trim();
        let v = v.trim_matches('"').trim_matches('\'').trim();
        if !v.is_empty() {
            return Some(base_name(v));
        }
    }

    None
}

/// 从 ZIP 本地文件头提取内部文件名
///
/// 头部布局：魔数 4 字节，偏移 26..28 为小端文件名长度，30 起为文件名。
/// 只有长度合理且完整落在嗅探范围内时才采用。
fn from_zip_header(head: &[u8]) -> Option<String> {
    if head.len() < 30 || !head.starts_with(b"PK\x03\x04") {
        return None;
    }
    let name_len = u16::from_le_bytes([head[26], head[27]]) as usize;
    if name_len == 0 || 30 + name_len > head.len() {
        return None;
    }
    let name = std::str::from_utf8(&head[30..30 + name_len]).ok()?;
    let name = base_name(name);
    if name.is_empty() {
        None
    } else {
        debug!("从 ZIP 本地文件头提取文件名: {}", name);
        Some(name)
    }
}

/// 取 URL 路径最后一个非空段并做百分号解码
fn from_url_path(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// 根据魔数推断扩展名
fn infer_extension(head: &[u8]) -> Option<&'static str> {
    for (magic, ext) in MAGIC_TABLE {
        if head.starts_with(magic) {
            return Some(ext);
        }
    }
    // 带内部偏移的格式单独判断
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return Some("webp");
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some("mp4");
    }
    None
}

/// 去掉路径成分，只留最后一段
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .to_string()
}

/// 文件名消毒
///
/// 去首尾空白，替换非法字符为 `_`；结果为空或 `.`、`/` 时兜底为
/// `download.bin`。幂等：`sanitize(sanitize(x)) == sanitize(x)`。
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    let replaced: String = trimmed
        .chars()
        .map(|c| if ILLEGAL_CHARS.contains(&c) { '_' } else { c })
        .collect();

    if replaced.is_empty() || replaced == "." || replaced == "/" {
        DEFAULT_FILENAME.to_string()
    } else {
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_filename_from_content_disposition() {
        let name = resolve_filename(
            &url("https://x/y/"),
            Some(r#"attachment; filename="archive.zip""#),
            b"",
        );
        assert_eq!(name, "archive.zip");
    }

    #[test]
    fn test_filename_rfc5987_extended_form() {
        let name = resolve_filename(
            &url("https://x/y/"),
            Some("attachment; filename*=UTF-8''%E6%96%87%E6%A1%A3.pdf"),
            b"",
        );
        assert_eq!(name, "文档.pdf");
    }

    #[test]
    fn test_extended_form_takes_precedence() {
        let name = resolve_filename(
            &url("https://x/y/"),
            Some(r#"attachment; filename="fallback.bin"; filename*=UTF-8''real%20name.bin"#),
            b"",
        );
        assert_eq!(name, "real name.bin");
    }

    #[test]
    fn test_filename_from_zip_header() {
        // PK\x03\x04 + 22 字节占位 + 文件名长度 10 + 扩展区长度 0 + 文件名
        let mut head = Vec::new();
        head.extend_from_slice(b"PK\x03\x04");
        head.extend_from_slice(&[0u8; 22]);
        head.extend_from_slice(&10u16.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes());
        head.extend_from_slice(b"inside.bin");

        let name = resolve_filename(&url("https://x/y/"), None, &head);
        assert_eq!(name, "inside.bin");
    }

    #[test]
    fn test_zip_name_length_out_of_sniff_range() {
        let mut head = Vec::new();
        head.extend_from_slice(b"PK\x03\x04");
        head.extend_from_slice(&[0u8; 22]);
        head.extend_from_slice(&9999u16.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes());
        head.extend_from_slice(b"short");

        // 名字长度超出嗅探范围，回退到 URL；ZIP 魔数仍触发扩展名补全
        let name = resolve_filename(&url("https://x/pkg"), None, &head);
        assert_eq!(name, "pkg.zip");
    }

    #[test]
    fn test_content_disposition_beats_zip_name() {
        let mut head = Vec::new();
        head.extend_from_slice(b"PK\x03\x04");
        head.extend_from_slice(&[0u8; 22]);
        head.extend_from_slice(&10u16.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes());
        head.extend_from_slice(b"inside.bin");

        let name = resolve_filename(
            &url("https://x/y/"),
            Some(r#"attachment; filename="outer.zip""#),
            &head,
        );
        assert_eq!(name, "outer.zip");
    }

    #[test]
    fn test_filename_from_url_path() {
        let name = resolve_filename(&url("https://x/a/b/report%20final.pdf"), None, b"");
        assert_eq!(name, "report final.pdf");
    }

    #[test]
    fn test_fallback_to_default() {
        let name = resolve_filename(&url("https://x/"), None, b"");
        assert_eq!(name, DEFAULT_FILENAME);
    }

    #[test]
    fn test_extension_from_magic_bytes() {
        let name = resolve_filename(&url("https://x/photo"), None, b"\xFF\xD8\xFF\xE0rest");
        assert_eq!(name, "photo.jpg");

        let name = resolve_filename(&url("https://x/doc"), None, b"%PDF-1.7 ...");
        assert_eq!(name, "doc.pdf");
    }

    #[test]
    fn test_magic_not_applied_when_extension_present() {
        let name = resolve_filename(&url("https://x/photo.png"), None, b"\xFF\xD8\xFF\xE0");
        assert_eq!(name, "photo.png");
    }

    #[test]
    fn test_sanitize_replaces_illegal_chars() {
        assert_eq!(sanitize_filename("a:b*c?d"), "a_b_c_d");
        assert_eq!(sanitize_filename("  padded.txt  "), "padded.txt");
        assert_eq!(sanitize_filename(r#"x<y>z|w"v"#), "x_y_z_w_v");
    }

    #[test]
    fn test_sanitize_fallbacks() {
        assert_eq!(sanitize_filename(""), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename("."), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename("   "), DEFAULT_FILENAME);
    }

    #[test]
    fn test_sanitize_idempotent() {
        let cases = ["a:b*c", "", ".", "  x.txt ", "normal.bin", "路径/文件.dat"];
        for case in cases {
            let once = sanitize_filename(case);
            assert_eq!(sanitize_filename(&once), once, "幂等性被破坏: {:?}", case);
        }
    }

    #[test]
    fn test_result_is_always_basename() {
        let name = resolve_filename(
            &url("https://x/y/"),
            Some(r#"attachment; filename="../../etc/passwd""#),
            b"",
        );
        assert_eq!(name, "passwd");
    }
}
