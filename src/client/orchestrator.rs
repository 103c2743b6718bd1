//! Client-side upload orchestration.
//!
//! Files larger than [`CHUNK_THRESHOLD`] are split into [`CHUNK_SIZE`] pieces
//! and sent one request at a time to `upload-chunk`; everything else goes to
//! `upload-stream` in a single request. A failure aborts only the file it
//! happened on.

use crate::models::{
    entry::{DirectoryEntry, FileEntry},
    upload::{ChunkUploadResponse, UploadResponse, headers as h},
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Body, Client as HttpClient, RequestBuilder, Response};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Files strictly larger than this are chunked.
pub const CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

pub const CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("server rejected the upload")]
    Rejected,
    #[error("last chunk of {total_chunks} was not acknowledged as complete")]
    Incomplete { total_chunks: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Direct,
    Chunked { total_chunks: u32 },
}

/// Pick how a file of `size` bytes is transferred.
pub fn plan_transfer(size: u64) -> TransferMode {
    if size > CHUNK_THRESHOLD {
        TransferMode::Chunked {
            total_chunks: size.div_ceil(CHUNK_SIZE) as u32,
        }
    } else {
        TransferMode::Direct
    }
}

/// A fresh identifier per upload attempt.
pub fn new_upload_id() -> String {
    Uuid::new_v4().to_string()
}

/// The client's copy of the directory currently in view.
#[derive(Debug, Default, Clone)]
pub struct Listing {
    pub files: Vec<FileEntry>,
    pub directories: Vec<DirectoryEntry>,
}

/// Outcome of one file in a batch.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub result: Result<TransferMode, ClientError>,
}

impl FileReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct UploadOrchestrator {
    http: HttpClient,
    base_url: String,
    owner_id: String,
    listing: Listing,
}

impl UploadOrchestrator {
    pub fn new(base_url: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            owner_id: owner_id.into(),
            listing: Listing::default(),
        }
    }

    pub fn listing(&self) -> &Listing {
        &self.listing
    }

    /// Upload every file in order. Later files are attempted even when an
    /// earlier one fails.
    pub async fn upload_batch(
        &mut self,
        files: &[PathBuf],
        parent_path: &str,
        path_in_view: &str,
    ) -> Vec<FileReport> {
        let mut reports = Vec::with_capacity(files.len());
        for path in files {
            let result = self.upload_file(path, parent_path, path_in_view).await;
            match &result {
                Ok(mode) => info!("uploaded {} ({:?})", path.display(), mode),
                Err(err) => warn!("upload of {} failed: {}", path.display(), err),
            }
            reports.push(FileReport {
                path: path.clone(),
                result,
            });
        }
        reports
    }

    async fn upload_file(
        &mut self,
        path: &Path,
        parent_path: &str,
        path_in_view: &str,
    ) -> Result<TransferMode, ClientError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no UTF-8 file name")
            })?
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();
        let target = Target {
            file_name: &file_name,
            parent_path,
            path_in_view,
        };

        let mode = plan_transfer(size);
        match mode {
            TransferMode::Direct => self.send_direct(path, &target).await?,
            TransferMode::Chunked { total_chunks } => {
                self.send_chunks(path, size, total_chunks, &target).await?
            }
        }
        Ok(mode)
    }

    async fn send_direct(&mut self, path: &Path, target: &Target<'_>) -> Result<(), ClientError> {
        let file = File::open(path).await?;
        let req = self
            .post("upload-stream", target)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        let resp: UploadResponse = checked(req.send().await?).await?.json().await?;
        if !resp.success {
            return Err(ClientError::Rejected);
        }
        self.listing = Listing {
            files: resp.new_files,
            directories: resp.new_directories,
        };
        Ok(())
    }

    /// Chunks are sent strictly one after another; a failed chunk ends the file.
    async fn send_chunks(
        &mut self,
        path: &Path,
        size: u64,
        total_chunks: u32,
        target: &Target<'_>,
    ) -> Result<(), ClientError> {
        let upload_id = new_upload_id();
        for index in 0..total_chunks {
            let offset = u64::from(index) * CHUNK_SIZE;
            let len = CHUNK_SIZE.min(size - offset);

            let mut file = File::open(path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let body = Body::wrap_stream(ReaderStream::new(file.take(len)));

            let req = self
                .post("upload-chunk", target)
                .header(h::FILE_ID, encode(&upload_id))
                .header(h::CHUNK_INDEX, index.to_string())
                .header(h::TOTAL_CHUNKS, total_chunks.to_string())
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(body);
            let resp: ChunkUploadResponse = checked(req.send().await?).await?.json().await?;
            if !resp.success {
                return Err(ClientError::Rejected);
            }
            debug!(upload_id = %upload_id, chunk = index, total = total_chunks, "chunk sent");

            if resp.is_complete == Some(true) {
                self.listing = Listing {
                    files: resp.new_files.unwrap_or_default(),
                    directories: resp.new_directories.unwrap_or_default(),
                };
                return Ok(());
            }
        }
        Err(ClientError::Incomplete { total_chunks })
    }

    fn post(&self, endpoint: &str, target: &Target<'_>) -> RequestBuilder {
        self.http
            .post(format!("{}/api/files/{}", self.base_url, endpoint))
            .header(h::OWNER_ID, encode(&self.owner_id))
            .header(h::FILE_NAME, encode(target.file_name))
            .header(h::PARENT_PATH, encode(target.parent_path))
            .header(h::PATH_IN_VIEW, encode(target.path_in_view))
    }
}

struct Target<'a> {
    file_name: &'a str,
    parent_path: &'a str,
    path_in_view: &'a str,
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

async fn checked(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::routes::spawn_test_server;
    use tempfile::TempDir;

    #[test]
    fn planning_uses_strict_threshold() {
        assert_eq!(plan_transfer(0), TransferMode::Direct);
        assert_eq!(plan_transfer(CHUNK_THRESHOLD), TransferMode::Direct);
        assert_eq!(
            plan_transfer(CHUNK_THRESHOLD + 1),
            TransferMode::Chunked { total_chunks: 11 }
        );
        assert_eq!(
            plan_transfer(25 * CHUNK_SIZE),
            TransferMode::Chunked { total_chunks: 25 }
        );
    }

    #[test]
    fn upload_ids_are_unique() {
        assert_ne!(new_upload_id(), new_upload_id());
    }

    #[tokio::test]
    async fn batch_uploads_large_and_small_files() {
        let storage = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let base = spawn_test_server(storage.path()).await;

        let big: Vec<u8> = (0..(11 * CHUNK_SIZE as usize + 123))
            .map(|i| (i * 7 % 256) as u8)
            .collect();
        let big_path = local.path().join("big video.bin");
        std::fs::write(&big_path, &big).unwrap();
        let small_path = local.path().join("note.txt");
        std::fs::write(&small_path, b"small").unwrap();

        let mut client = UploadOrchestrator::new(&base, "alice");
        let reports = client
            .upload_batch(&[big_path, small_path], "/media/", "/media/")
            .await;

        assert!(matches!(
            reports[0].result,
            Ok(TransferMode::Chunked { total_chunks: 12 })
        ));
        assert!(matches!(reports[1].result, Ok(TransferMode::Direct)));
        assert_eq!(
            std::fs::read(storage.path().join("alice/media/big video.bin")).unwrap(),
            big
        );
        let names: Vec<_> = client
            .listing()
            .files
            .iter()
            .map(|f| f.file_name.as_str())
            .collect();
        assert_eq!(names, ["big video.bin", "note.txt"]);
        let leftovers: Vec<_> = std::fs::read_dir(storage.path().join(".chunks/alice"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, [".done"]);
    }

    #[tokio::test]
    async fn hyphenated_owner_lands_in_its_own_directory() {
        let storage = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let base = spawn_test_server(storage.path()).await;
        let path = local.path().join("plan.txt");
        std::fs::write(&path, b"q3").unwrap();

        let mut client = UploadOrchestrator::new(&base, "team-a");
        let reports = client.upload_batch(&[path], "/", "/").await;

        assert!(reports[0].is_success());
        assert_eq!(
            std::fs::read(storage.path().join("team-a/plan.txt")).unwrap(),
            b"q3"
        );
        assert!(!storage.path().join("team%2Da").exists());
    }

    #[tokio::test]
    async fn failed_file_does_not_stop_the_batch() {
        let storage = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let base = spawn_test_server(storage.path()).await;
        let present = local.path().join("ok.txt");
        std::fs::write(&present, b"fine").unwrap();

        let mut client = UploadOrchestrator::new(&base, "alice");
        let reports = client
            .upload_batch(&[local.path().join("missing.txt"), present], "/", "/")
            .await;

        assert!(matches!(reports[0].result, Err(ClientError::Io(_))));
        assert!(reports[1].is_success());
        assert_eq!(client.listing().files.len(), 1);
    }

    #[tokio::test]
    async fn server_rejection_is_reported_per_file() {
        let storage = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let base = spawn_test_server(storage.path()).await;
        let path = local.path().join("a.txt");
        std::fs::write(&path, b"data").unwrap();

        let mut client = UploadOrchestrator::new(&base, "alice");
        let reports = client.upload_batch(&[path], "/../escape/", "/").await;

        assert!(matches!(
            reports[0].result,
            Err(ClientError::Status { status: 400, .. })
        ));
        assert!(client.listing().files.is_empty());
    }
}
