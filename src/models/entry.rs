//! Directory listing entries returned after an upload completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file inside a user directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileEntry {
    /// Owner of the file.
    pub user_id: String,

    /// Directory containing the file, always `/`-rooted and `/`-terminated.
    pub parent_path: String,

    pub file_name: String,

    pub has_write_access: bool,

    pub size_in_bytes: u64,

    pub updated_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

/// A sub-directory inside a user directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub parent_path: String,
    pub directory_name: String,
    pub has_write_access: bool,
    pub size_in_bytes: u64,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
