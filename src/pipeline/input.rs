//! Input resolution: read a user-supplied path or URL into memory.
//!
//! The rasterizer loads documents from a byte buffer, so both local files and
//! downloads end up as an [`InputDocument`]. The `%PDF` magic is checked here
//! so callers get a precise error instead of a generic pdfium failure.

use crate::error::ConvertError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A document read into memory, with the name used for reporting and export.
#[derive(Debug, Clone)]
pub struct InputDocument {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or URL to the document bytes.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<InputDocument, ConvertError> {
    if input.trim().is_empty() {
        return Err(ConvertError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<InputDocument, ConvertError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ConvertError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ConvertError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    check_magic(&bytes, path)?;

    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(InputDocument {
        name: file_name_of(path),
        bytes,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<InputDocument, ConvertError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ConvertError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let request_error = |e: reqwest::Error| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ConvertError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(request_error)?;
    if !response.status().is_success() {
        return Err(ConvertError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(request_error)?.to_vec();
    let name = extract_filename(url);
    check_magic(&bytes, Path::new(&name))?;

    info!("Downloaded {} ({} bytes)", name, bytes.len());
    Ok(InputDocument { name, bytes })
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), ConvertError> {
    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(ConvertError::NotAPdf {
            path: PathBuf::from(path),
            magic,
        });
    }
    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string())
}

/// Last URL path segment when it looks like a file name.
fn extract_filename(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
