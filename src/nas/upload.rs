//! Resumable chunked upload client (tus 1.0 style)
//!
//! Creation POST declares the total length and the file name, then the
//! content goes up in fixed-size PATCH chunks carrying the current offset.
//! The server echoes the new offset after each chunk; a mismatch aborts the
//! upload rather than silently corrupting it.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use url::Url;

use crate::error::{AppError, Result};

const TUS_VERSION: &str = "1.0.0";
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Chunked upload client bound to one creation endpoint
pub struct ChunkedUploader {
    http: reqwest::Client,
    base_url: String,
}

impl ChunkedUploader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Upload a local file; returns the upload's URL on the server.
    pub async fn upload(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let length = fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");

        let create = self
            .http
            .post(&self.base_url)
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Length", length.to_string())
            .header("Upload-Metadata", upload_metadata(file_name))
            .send()
            .await?;
        if create.status() != reqwest::StatusCode::CREATED {
            return Err(AppError::Nas(format!(
                "upload creation failed, status code = {}",
                create.status().as_u16()
            )));
        }

        let location = create
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Nas("upload creation response missing location".to_string()))?;
        let upload_url = resolve_location(&self.base_url, location)?;

        let mut file = fs::File::open(path).await?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut offset: u64 = 0;

        while offset < length {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }

            let response = self
                .http
                .patch(&upload_url)
                .header("Tus-Resumable", TUS_VERSION)
                .header("Upload-Offset", offset.to_string())
                .header(reqwest::header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(chunk[..n].to_vec())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(AppError::Nas(format!(
                    "chunk upload failed at offset {}, status code = {}",
                    offset,
                    response.status().as_u16()
                )));
            }

            offset = next_offset(
                offset,
                n as u64,
                response
                    .headers()
                    .get("Upload-Offset")
                    .and_then(|v| v.to_str().ok()),
            )?;
            debug!("uploaded {}/{} bytes of {}", offset, length, file_name);
        }

        info!("upload of {} finished", path.display());
        Ok(upload_url)
    }
}

/// tus metadata header: space separated "key base64(value)" pairs
fn upload_metadata(file_name: &str) -> String {
    format!("filename {}", BASE64.encode(file_name))
}

/// The server echoes the new offset after each chunk; when present it must
/// land exactly past the bytes just sent.
fn next_offset(offset: u64, sent: u64, reported: Option<&str>) -> Result<u64> {
    let expected = offset + sent;
    match reported.and_then(|v| v.parse::<u64>().ok()) {
        Some(value) if value == expected => Ok(value),
        Some(value) => Err(AppError::Nas(format!(
            "server offset {} does not match expected {}",
            value, expected
        ))),
        None => Ok(expected),
    }
}

/// Location headers may be absolute or relative to the creation endpoint.
fn resolve_location(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| AppError::Nas(format!("invalid upload base url {}: {}", base, e)))?;
    let resolved = base
        .join(location)
        .map_err(|e| AppError::Nas(format!("invalid upload location {}: {}", location, e)))?;
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_encodes_file_name() {
        // "recording.mp4" in base64
        assert_eq!(
            upload_metadata("recording.mp4"),
            "filename cmVjb3JkaW5nLm1wNA=="
        );
    }

    #[test]
    fn offsets_advance_past_each_chunk() {
        // server confirms the expected offset
        assert_eq!(next_offset(0, 1024, Some("1024")).unwrap(), 1024);
        assert_eq!(next_offset(1024, 1024, Some("2048")).unwrap(), 2048);
        // servers that omit the header are trusted
        assert_eq!(next_offset(2048, 512, None).unwrap(), 2560);
    }

    #[test]
    fn mismatched_server_offset_aborts() {
        assert!(next_offset(0, 1024, Some("512")).is_err());
        assert!(next_offset(1024, 1024, Some("1024")).is_err());
    }

    #[test]
    fn resolves_relative_and_absolute_locations() {
        assert_eq!(
            resolve_location("http://nas:8080/files/", "/files/abc123").unwrap(),
            "http://nas:8080/files/abc123"
        );
        assert_eq!(
            resolve_location("http://nas:8080/files/", "http://nas:8080/files/abc123").unwrap(),
            "http://nas:8080/files/abc123"
        );
    }
}
