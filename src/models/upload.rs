//! Upload request metadata and response envelopes.

use super::entry::{DirectoryEntry, FileEntry};
use serde::{Deserialize, Serialize};

/// Request headers of the upload wire protocol. Values are percent-encoded.
pub mod headers {
    /// Authenticated owner, set by the fronting auth layer.
    pub const OWNER_ID: &str = "x-owner-id";
    pub const FILE_NAME: &str = "x-file-name";
    pub const PARENT_PATH: &str = "x-parent-path";
    pub const PATH_IN_VIEW: &str = "x-path-in-view";
    pub const CHUNK_INDEX: &str = "x-chunk-index";
    pub const TOTAL_CHUNKS: &str = "x-total-chunks";
    pub const FILE_ID: &str = "x-file-id";
}

/// One numbered piece of a chunked upload, as described by the request headers.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub file_name: String,
    pub parent_path: String,
    pub path_in_view: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

/// Where a chunked upload stands after one chunk has been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProgress {
    /// Chunks are still missing, or another request is assembling right now.
    Pending,
    /// This request assembled the final file.
    Assembled,
    /// A concurrent request already assembled the final file.
    AlreadyAssembled,
}

impl UploadProgress {
    pub fn is_complete(self) -> bool {
        !matches!(self, UploadProgress::Pending)
    }
}

/// Response body of `POST /api/files/upload-chunk`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_files: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_directories: Option<Vec<DirectoryEntry>>,
}

/// Response body of the single-request upload endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub new_files: Vec<FileEntry>,
    pub new_directories: Vec<DirectoryEntry>,
}
