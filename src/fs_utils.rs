use percent_encoding::percent_decode_str;
use reqwest::Url;
use std::{io, path::Path, path::PathBuf};

/// Suffix of the in-progress sibling of a final file.
pub const PARTIAL_SUFFIX: &str = "partial";

static FORBIDDEN_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Returns a filename that is safe to use on Windows, Linux and Mac OS.
///
/// Forbidden and control characters become '_', leading/trailing whitespace
/// and dots are trimmed, reserved Windows device names get a trailing '_'.
pub fn cleanup_filename(input: &str) -> String {
    let mut result: String = input
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' | '^' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect::<String>()
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();

    let upper_result = result.to_ascii_uppercase();
    if FORBIDDEN_WINDOWS_NAMES.iter().any(|&n| n == upper_result) {
        result.push('_');
    }

    while result.len() > 255 {
        result.pop();
    }
    result
}

/// Local file name for a remote URL: its last path segment, percent-decoded
/// and sanitized. Falls back to `download` when the URL has no usable path.
pub fn file_name_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    let cleaned = cleanup_filename(&decoded);
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// `<final>.partial`
pub fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Size of the file at `path`, or 0 if it does not exist.
pub async fn existing_len<P: AsRef<Path>>(path: P) -> io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Removes the file at `path`, ignoring a missing file.
pub async fn remove_if_exists<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Atomically moves `src` over `dst`.
pub async fn atomic_replace(src: PathBuf, dst: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || atomicwrites::replace_atomic(&src, &dst))
        .await
        .map_err(io::Error::other)??;

    Ok(())
}
