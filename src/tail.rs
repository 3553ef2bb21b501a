//! Reverse log reader.
//!
//! Returns the last N lines of a file by reading fixed-size blocks backward
//! from the end, so large append-only logs are never loaded whole.

use crate::error::{Error, Result};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Last `n` lines of `path` in forward order, using [`DEFAULT_BLOCK_SIZE`].
pub async fn read_last_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    read_last_lines_with(path, n, DEFAULT_BLOCK_SIZE).await
}

/// Last `n` lines of `path` in forward order.
///
/// Line semantics match [`str::lines`]: a final line without a trailing
/// newline still counts, `\r\n` endings are stripped, and an empty file has
/// no lines. Splitting happens on raw bytes before decoding, so a multi-byte
/// character straddling a block boundary is never cut. Invalid UTF-8 inside a
/// line is replaced rather than rejected.
pub async fn read_last_lines_with(path: &Path, n: usize, block_size: usize) -> Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::from_io_at(e, path))?;
    if n == 0 {
        return Ok(Vec::new());
    }

    let len = file.metadata().await?.len();
    let block = block_size.max(1) as u64;
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    while pos > 0 {
        let read_size = block.min(pos);
        pos -= read_size;
        file.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk).await?;

        newlines += chunk.iter().filter(|b| **b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // The file's final newline terminates the last line; it is not a
        // boundary between two lines.
        let boundaries = newlines - usize::from(buf.last() == Some(&b'\n'));
        if boundaries >= n {
            break;
        }
    }

    Ok(split_tail(&buf, n))
}

/// Split `buf` into lines and keep the last `n`. When `buf` does not start at
/// the beginning of the file its first segment may be partial, but the caller
/// only stops early once more than `n` segments exist, so it is never kept.
fn split_tail(buf: &[u8], n: usize) -> Vec<String> {
    if buf.is_empty() {
        return Vec::new();
    }
    let body = buf.strip_suffix(b"\n").unwrap_or(buf);
    let segments: Vec<&[u8]> = body.split(|b| *b == b'\n').collect();
    let skip = segments.len().saturating_sub(n);

    segments[skip..]
        .iter()
        .map(|seg| {
            let seg = seg.strip_suffix(b"\r").unwrap_or(seg);
            String::from_utf8_lossy(seg).into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reference(content: &str, n: usize) -> Vec<String> {
        let lines: Vec<String> = content.lines().map(String::from).collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].to_vec()
    }

    fn build(lines: usize, trailing_newline: bool) -> String {
        let mut out = String::new();
        for i in 0..lines {
            // Mix in multi-byte characters so small blocks split them.
            out.push_str(&format!("line {i} é✓ {}", "x".repeat(i % 7)));
            if i + 1 < lines || trailing_newline {
                out.push('\n');
            }
        }
        out
    }

    async fn check(content: &str, n: usize, block: usize) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        std::fs::write(&path, content).unwrap();
        let got = read_last_lines_with(&path, n, block).await.unwrap();
        assert_eq!(
            got,
            reference(content, n),
            "n={n} block={block} len={}",
            content.len()
        );
    }

    #[tokio::test]
    async fn matches_forward_reference() {
        let n = 5;
        for total in [0usize, 1, n, n + 1000] {
            for trailing in [true, false] {
                let content = build(total, trailing);
                for block in [1usize, 3, 7, 64, DEFAULT_BLOCK_SIZE] {
                    // Tiny blocks over the large file only add runtime.
                    if block < 64 && total > n {
                        continue;
                    }
                    for want in [0usize, 1, n, total, total + 3] {
                        check(&content, want, block).await;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn empty_file_yields_no_lines() {
        check("", 10, 4).await;
    }

    #[tokio::test]
    async fn blank_lines_are_kept() {
        check("a\n\n\nb\n", 3, 2).await;
        check("\n", 1, 8).await;
    }

    #[tokio::test]
    async fn crlf_endings_are_stripped() {
        check("one\r\ntwo\r\nthree\r\n", 2, 4).await;
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = read_last_lines(&tmp.path().join("nope.jsonl"), 3)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stops_reading_once_enough_lines_found() {
        // Corrupt bytes far from the tail must not leak into the result.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(build(200, true).as_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let got = read_last_lines_with(&path, 2, 16).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[1].starts_with("line 199"));
        assert!(got.iter().all(|l| !l.contains('\u{fffd}')));
    }
}
