//! Input loading: read a program text file or download it from a URL.
//!
//! The pipeline works on text produced by an external extraction step
//! (`pdftotext` or similar). Binary input, PDFs in particular, is rejected
//! here with a hint instead of being fed to the boundary detector.

use crate::document::Document;
use crate::error::ExtractError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a document from a local path or an HTTP(S) URL.
pub async fn load_document(input: &str, timeout_secs: u64) -> Result<Document, ExtractError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        load_local(Path::new(input)).await
    }
}

/// Read a local text file. The document id is the file name.
pub async fn load_local(path: &Path) -> Result<Document, ExtractError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ExtractError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ExtractError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let id = source_id_for_path(path);
    let text = decode_text(&id, &bytes)?;
    debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(Document::new(id, text))
}

/// Download a URL into memory. The document id is the last path segment.
async fn download_url(url: &str, timeout_secs: u64) -> Result<Document, ExtractError> {
    info!("Downloading program text from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ExtractError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let id = source_id_for_url(url);
    let text = decode_text(&id, &bytes)?;
    info!("Downloaded {} ({} bytes)", id, bytes.len());
    Ok(Document::new(id, text))
}

/// Validate and normalise raw bytes as program text.
///
/// Rejects PDFs and anything with NUL bytes or invalid UTF-8, strips a
/// UTF-8 BOM and converts CRLF line endings to LF.
pub fn decode_text(source_id: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    let not_text = || {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        ExtractError::NotText {
            source_id: source_id.to_string(),
            magic,
        }
    };

    if bytes.starts_with(b"%PDF") || bytes.iter().take(8192).any(|&b| b == 0) {
        return Err(not_text());
    }
    let text = std::str::from_utf8(bytes).map_err(|_| not_text())?;
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);
    Ok(text.replace("\r\n", "\n"))
}

fn source_id_for_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Last non-empty URL path segment, or the host.
fn source_id_for_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(last) = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
        {
            return last.to_string();
        }
        if let Some(host) = parsed.host_str() {
            return host.to_string();
        }
    }
    url.to_string()
}

/// Default output path for a document id: `<stem>.json` inside `dir`.
pub fn output_path_for(dir: &Path, source_id: &str) -> PathBuf {
    let stem = Path::new(source_id)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sessions".to_string());
    dir.join(format!("{stem}.json"))
}
