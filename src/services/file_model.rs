//! Disk-backed file and directory models.
//!
//! These stand in for the metadata layer: they create files beneath an owner's
//! tree and list a directory the way the file browser expects.

use crate::{
    models::entry::{DirectoryEntry, FileEntry},
    services::{
        staged_file::{TEMP_PREFIX, write_atomically},
        storage_layout::{
            StorageLayout, UploadResult, ensure_file_name_safe, ensure_segment_safe,
            ensure_user_path_safe,
        },
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, pin_mut};
use std::{fs::Metadata, io};
use tokio::fs;
use tokio_util::io::StreamReader;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct FileModel {
    layout: StorageLayout,
}

#[derive(Clone, Debug)]
pub struct DirectoryModel {
    layout: StorageLayout,
}

impl FileModel {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Create (or replace) a file holding `contents`.
    pub async fn create(
        &self,
        owner_id: &str,
        parent_path: &str,
        name: &str,
        contents: &str,
    ) -> UploadResult<()> {
        self.ensure_target(owner_id, parent_path, name)?;
        let dest = self.layout.user_file(owner_id, parent_path, name);
        write_atomically(&dest, &mut contents.as_bytes()).await?;
        debug!("created {} ({} bytes)", dest.display(), contents.len());
        Ok(())
    }

    /// Stream a request body straight to its destination file.
    ///
    /// Returns the number of bytes written. Nothing is visible at the
    /// destination until the stream has ended successfully.
    pub async fn create_from_stream<S>(
        &self,
        owner_id: &str,
        parent_path: &str,
        name: &str,
        stream: S,
    ) -> UploadResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.ensure_target(owner_id, parent_path, name)?;
        let dest = self.layout.user_file(owner_id, parent_path, name);

        pin_mut!(stream);
        let mut reader = StreamReader::new(stream);
        let written = write_atomically(&dest, &mut reader).await?;
        debug!("streamed {} bytes into {}", written, dest.display());
        Ok(written)
    }

    /// Files directly inside `view_path`, sorted by name.
    pub async fn list(&self, owner_id: &str, view_path: &str) -> UploadResult<Vec<FileEntry>> {
        ensure_segment_safe("ownerId", owner_id)?;
        ensure_user_path_safe("pathInView", view_path)?;
        let parent_path = normalize_dir_path(view_path);
        let entries = read_entries(&self.layout, owner_id, view_path).await?;

        Ok(entries
            .into_iter()
            .filter(|(_, meta)| meta.is_file())
            .map(|(name, meta)| {
                let (updated_at, created_at) = timestamps(&meta);
                FileEntry {
                    user_id: owner_id.to_string(),
                    parent_path: parent_path.clone(),
                    file_name: name,
                    has_write_access: true,
                    size_in_bytes: meta.len(),
                    updated_at,
                    created_at,
                }
            })
            .collect())
    }

    fn ensure_target(&self, owner_id: &str, parent_path: &str, name: &str) -> UploadResult<()> {
        ensure_segment_safe("ownerId", owner_id)?;
        ensure_user_path_safe("parentPath", parent_path)?;
        ensure_file_name_safe(name)
    }
}

impl DirectoryModel {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Sub-directories directly inside `view_path`, sorted by name.
    pub async fn list(
        &self,
        owner_id: &str,
        view_path: &str,
    ) -> UploadResult<Vec<DirectoryEntry>> {
        ensure_segment_safe("ownerId", owner_id)?;
        ensure_user_path_safe("pathInView", view_path)?;
        let parent_path = normalize_dir_path(view_path);
        let entries = read_entries(&self.layout, owner_id, view_path).await?;

        Ok(entries
            .into_iter()
            .filter(|(_, meta)| meta.is_dir())
            .map(|(name, meta)| {
                let (updated_at, created_at) = timestamps(&meta);
                DirectoryEntry {
                    user_id: owner_id.to_string(),
                    parent_path: parent_path.clone(),
                    directory_name: name,
                    has_write_access: true,
                    size_in_bytes: 0,
                    updated_at,
                    created_at,
                }
            })
            .collect())
    }
}

/// Read one directory level. A directory that does not exist lists as empty.
async fn read_entries(
    layout: &StorageLayout,
    owner_id: &str,
    view_path: &str,
) -> io::Result<Vec<(String, Metadata)>> {
    let dir = layout.user_dir(owner_id, view_path);
    let mut read_dir = match fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) {
            continue;
        }
        match entry.metadata().await {
            Ok(meta) => entries.push((name, meta)),
            // removed between readdir and stat
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn timestamps(meta: &Metadata) -> (DateTime<Utc>, DateTime<Utc>) {
    let updated_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let created_at = meta
        .created()
        .map(DateTime::<Utc>::from)
        .unwrap_or(updated_at);
    (updated_at, created_at)
}

fn normalize_dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}
