//! Path resolution for durable files and transient chunk storage.
//!
//! Everything lives beneath one storage root:
//! - `root/{owner}/{parent_path}/{file_name}` for user files
//! - `root/.chunks/{owner}/{upload_id}/chunk_{index}` for chunks still awaiting assembly
//! - `root/.chunks/{owner}/.done/{upload_id}` once an upload has been assembled

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Directory under the storage root reserved for in-flight chunked uploads.
pub const CHUNKS_DIR: &str = ".chunks";

/// Per-owner directory of completion records. Upload ids never start with a
/// dot, so it cannot collide with an upload directory.
pub const COMPLETED_DIR: &str = ".done";

const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("assembly of upload `{upload_id}` failed: {source}")]
    Assembly {
        upload_id: String,
        #[source]
        source: io::Error,
    },
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Clone, Debug)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_storage_path(&self) -> &Path {
        &self.root
    }

    /// Root of all transient upload directories.
    pub fn chunks_root(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    pub fn owner_chunks_dir(&self, owner_id: &str) -> PathBuf {
        self.chunks_root().join(owner_id)
    }

    pub fn upload_dir(&self, owner_id: &str, upload_id: &str) -> PathBuf {
        self.owner_chunks_dir(owner_id).join(upload_id)
    }

    pub fn completed_dir(&self, owner_id: &str) -> PathBuf {
        self.owner_chunks_dir(owner_id).join(COMPLETED_DIR)
    }

    /// Written after a successful assembly; later chunks for the same upload are ignored.
    pub fn completion_record(&self, owner_id: &str, upload_id: &str) -> PathBuf {
        self.completed_dir(owner_id).join(upload_id)
    }

    pub fn chunk_path(&self, owner_id: &str, upload_id: &str, index: u32) -> PathBuf {
        self.upload_dir(owner_id, upload_id)
            .join(format!("chunk_{}", index))
    }

    /// Absolute on-disk directory for a validated `/`-rooted user path.
    pub fn user_dir(&self, owner_id: &str, path: &str) -> PathBuf {
        let mut dir = self.root.join(owner_id);
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            dir.push(segment);
        }
        dir
    }

    pub fn user_file(&self, owner_id: &str, parent_path: &str, file_name: &str) -> PathBuf {
        self.user_dir(owner_id, parent_path).join(file_name)
    }
}

/// Check a user-visible directory path such as `parentPath` or `pathInView`.
///
/// Must start with `/` and must not contain a `..` segment.
pub fn ensure_user_path_safe(label: &str, path: &str) -> UploadResult<()> {
    if !path.starts_with('/') {
        return Err(UploadError::Validation(format!("{} must be absolute", label)));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(UploadError::Validation(format!(
            "{} must not contain parent directory segments",
            label
        )));
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(UploadError::Validation(format!("{} contains control characters", label)));
    }
    Ok(())
}

/// Check an identifier that becomes one path component on disk (owner id, upload id).
///
/// Leading dots are refused so an owner can never alias the `.chunks` tree.
pub fn ensure_segment_safe(label: &str, value: &str) -> UploadResult<()> {
    ensure_component(label, value)?;
    if value.starts_with('.') {
        return Err(UploadError::Validation(format!(
            "{} must not start with a dot",
            label
        )));
    }
    Ok(())
}

/// Check a destination file name.
pub fn ensure_file_name_safe(value: &str) -> UploadResult<()> {
    ensure_component("fileName", value)?;
    if value == "." || value == ".." {
        return Err(UploadError::Validation("fileName is invalid".into()));
    }
    Ok(())
}

fn ensure_component(label: &str, value: &str) -> UploadResult<()> {
    if value.is_empty() {
        return Err(UploadError::Validation(format!("{} is required", label)));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(UploadError::Validation(format!("{} is too long", label)));
    }
    if value
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return Err(UploadError::Validation(format!(
            "{} contains an invalid character",
            label
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_paths_must_be_absolute() {
        assert!(ensure_user_path_safe("parentPath", "/").is_ok());
        assert!(ensure_user_path_safe("parentPath", "/photos/2025/").is_ok());
        assert!(ensure_user_path_safe("parentPath", "photos/").is_err());
        assert!(ensure_user_path_safe("parentPath", "").is_err());
    }

    #[test]
    fn user_paths_reject_traversal() {
        assert!(ensure_user_path_safe("pathInView", "/../etc/").is_err());
        assert!(ensure_user_path_safe("pathInView", "/a/../../b").is_err());
        assert!(ensure_user_path_safe("pathInView", "/a/..").is_err());
        assert!(ensure_user_path_safe("pathInView", "/a\\..\\b").is_err());
        assert!(ensure_user_path_safe("pathInView", "/a..b/").is_ok());
    }

    #[test]
    fn segments_are_single_components() {
        assert!(ensure_segment_safe("uploadId", "3f2a9c").is_ok());
        assert!(ensure_segment_safe("uploadId", "").is_err());
        assert!(ensure_segment_safe("uploadId", "a/b").is_err());
        assert!(ensure_segment_safe("ownerId", ".chunks").is_err());
        assert!(ensure_segment_safe("ownerId", "bad\0name").is_err());
        assert!(ensure_segment_safe("uploadId", &"x".repeat(256)).is_err());
    }

    #[test]
    fn file_names_allow_dotfiles_but_not_traversal() {
        assert!(ensure_file_name_safe("report.pdf").is_ok());
        assert!(ensure_file_name_safe(".bashrc").is_ok());
        assert!(ensure_file_name_safe("..").is_err());
        assert!(ensure_file_name_safe(".").is_err());
        assert!(ensure_file_name_safe("a\\b").is_err());
    }

    #[test]
    fn layout_builds_expected_paths() {
        let layout = StorageLayout::new("/srv/files");
        assert_eq!(
            layout.chunk_path("alice", "u1", 3),
            PathBuf::from("/srv/files/.chunks/alice/u1/chunk_3")
        );
        assert_eq!(
            layout.user_file("alice", "/docs/2025/", "a.txt"),
            PathBuf::from("/srv/files/alice/docs/2025/a.txt")
        );
        assert_eq!(layout.user_dir("alice", "/"), PathBuf::from("/srv/files/alice"));
        assert_eq!(
            layout.completion_record("alice", "u1"),
            PathBuf::from("/srv/files/.chunks/alice/.done/u1")
        );
    }
}
