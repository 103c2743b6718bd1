//! src/services/chunk_service.rs
//!
//! ChunkService receives numbered chunks of one logical upload into a
//! transient directory, decides when every chunk is present, and assembles
//! them into the destination file exactly once.
//!
//! Layout: `base/.chunks/{owner}/{upload_id}/chunk_{index}`. A chunk is staged
//! under a temporary name and renamed into place, so a request that dies
//! mid-body never leaves a `chunk_{index}` behind. Resending an index replaces
//! the previous artifact.
//!
//! Each upload has a reader/writer lock: chunk writes share it, completion
//! takes it exclusively. Assembly is additionally gated on creating a claim
//! marker with `create_new`, so two requests that both deliver the last
//! missing chunk cannot both assemble, even across processes. A successful
//! assembly leaves a completion record under `.done/`, outside the upload
//! directory it removes, and chunks arriving afterwards are dropped.

use crate::{
    models::upload::{ChunkRequest, UploadProgress},
    services::{
        staged_file::{StagedFile, copy_buffered, write_atomically},
        storage_layout::{
            COMPLETED_DIR, StorageLayout, UploadError, UploadResult, ensure_file_name_safe,
            ensure_segment_safe, ensure_user_path_safe,
        },
    },
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File, OpenOptions},
    sync::RwLock,
};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Upper bound on `totalChunks`; the completion check probes every index.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// Created inside an upload directory by the request that wins assembly.
const CLAIM_MARKER: &str = ".assembling";

type UploadKey = (String, String);

#[derive(Clone)]
pub struct ChunkService {
    layout: StorageLayout,

    /// One lock per in-flight `(owner, upload_id)`; entries are dropped once
    /// no request holds them.
    locks: Arc<DashMap<UploadKey, Arc<RwLock<()>>>>,
}

impl ChunkService {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Reject anything that could escape the storage root or name an
    /// impossible chunk. Runs before any disk access.
    pub fn validate(owner_id: &str, req: &ChunkRequest) -> UploadResult<()> {
        ensure_segment_safe("ownerId", owner_id)?;
        ensure_segment_safe("uploadId", &req.upload_id)?;
        ensure_file_name_safe(&req.file_name)?;
        ensure_user_path_safe("parentPath", &req.parent_path)?;
        ensure_user_path_safe("pathInView", &req.path_in_view)?;
        if req.total_chunks == 0 || req.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(UploadError::Validation(format!(
                "totalChunks must be between 1 and {}",
                MAX_TOTAL_CHUNKS
            )));
        }
        if req.chunk_index >= req.total_chunks {
            return Err(UploadError::Validation(
                "chunkIndex must be lower than totalChunks".into(),
            ));
        }
        Ok(())
    }

    /// Store one chunk body. Memory use is one fixed copy buffer regardless of
    /// chunk size.
    ///
    /// Returns the number of bytes stored. A chunk for an upload that has
    /// already been assembled is discarded unread and stores nothing.
    pub async fn receive_chunk<S>(
        &self,
        owner_id: &str,
        req: &ChunkRequest,
        body: S,
    ) -> UploadResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        Self::validate(owner_id, req)?;

        let key = (owner_id.to_string(), req.upload_id.clone());
        let lock = self.lock_for(&key);
        let outcome = {
            let _shared = lock.read().await;
            if self.is_assembled(owner_id, &req.upload_id).await {
                debug!(
                    owner_id,
                    upload_id = %req.upload_id,
                    chunk = req.chunk_index,
                    "upload already assembled, chunk dropped"
                );
                Ok(0)
            } else {
                self.store_chunk(owner_id, req, body).await
            }
        };
        self.release(&key, lock);
        outcome
    }

    async fn store_chunk<S>(
        &self,
        owner_id: &str,
        req: &ChunkRequest,
        body: S,
    ) -> UploadResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let upload_dir = self.layout.upload_dir(owner_id, &req.upload_id);
        fs::create_dir_all(&upload_dir).await?;

        let chunk_path = self
            .layout
            .chunk_path(owner_id, &req.upload_id, req.chunk_index);
        pin_mut!(body);
        let mut reader = StreamReader::new(body);
        let written = write_atomically(&chunk_path, &mut reader).await?;

        debug!(
            owner_id,
            upload_id = %req.upload_id,
            chunk = req.chunk_index,
            total = req.total_chunks,
            bytes = written,
            "stored chunk"
        );
        Ok(written)
    }

    /// True only when every `chunk_0..chunk_{total-1}` exists. Probe errors
    /// count as "not yet complete".
    ///
    /// Probes run from the highest index down: a sequential sender is missing
    /// the tail, so an incomplete upload usually fails on the first probe.
    pub async fn is_complete(&self, owner_id: &str, upload_id: &str, total_chunks: u32) -> bool {
        for index in (0..total_chunks).rev() {
            let path = self.layout.chunk_path(owner_id, upload_id, index);
            match fs::try_exists(&path).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    debug!("probe of {} failed: {}", path.display(), err);
                    return false;
                }
            }
        }
        true
    }

    /// Concatenate chunks in index order into the destination file, then
    /// remove the upload's transient directory.
    ///
    /// Callers must have confirmed completion. On failure the destination is
    /// left untouched and the transient directory stays for the sweeper.
    pub async fn assemble(
        &self,
        owner_id: &str,
        parent_path: &str,
        file_name: &str,
        upload_id: &str,
        total_chunks: u32,
    ) -> UploadResult<u64> {
        let assembly_err = |source: io::Error| UploadError::Assembly {
            upload_id: upload_id.to_string(),
            source,
        };

        let dest = self.layout.user_file(owner_id, parent_path, file_name);
        info!(
            owner_id,
            upload_id,
            total_chunks,
            dest = %dest.display(),
            "assembling upload"
        );

        let mut staged = StagedFile::create(&dest).await.map_err(assembly_err)?;
        let mut total_bytes = 0u64;
        for index in 0..total_chunks {
            let chunk_path = self.layout.chunk_path(owner_id, upload_id, index);
            match append_chunk(&chunk_path, staged.file_mut()).await {
                Ok(copied) => total_bytes += copied,
                Err(err) => {
                    staged.discard().await;
                    return Err(assembly_err(err));
                }
            }
        }
        staged.commit().await.map_err(assembly_err)?;
        self.record_completion(owner_id, upload_id, total_bytes)
            .await
            .map_err(assembly_err)?;

        let upload_dir = self.layout.upload_dir(owner_id, upload_id);
        fs::remove_dir_all(&upload_dir)
            .await
            .map_err(assembly_err)?;
        prune_empty_dirs(
            &self.layout.owner_chunks_dir(owner_id),
            &self.layout.chunks_root(),
        )
        .await;

        info!(owner_id, upload_id, bytes = total_bytes, "assembly complete");
        Ok(total_bytes)
    }

    /// Run the completion check and, if every chunk is present, assemble.
    ///
    /// At most one caller per upload gets [`UploadProgress::Assembled`]. A caller
    /// that finds the completion record reports
    /// [`UploadProgress::AlreadyAssembled`]; one that loses the claim marker to
    /// another process reports [`UploadProgress::Pending`].
    pub async fn complete_if_ready(
        &self,
        owner_id: &str,
        req: &ChunkRequest,
    ) -> UploadResult<UploadProgress> {
        let key = (owner_id.to_string(), req.upload_id.clone());
        let lock = self.lock_for(&key);
        let outcome = {
            let _exclusive = lock.write().await;
            self.try_complete(owner_id, req).await
        };
        self.release(&key, lock);
        outcome
    }

    async fn try_complete(
        &self,
        owner_id: &str,
        req: &ChunkRequest,
    ) -> UploadResult<UploadProgress> {
        if self.is_assembled(owner_id, &req.upload_id).await {
            return Ok(UploadProgress::AlreadyAssembled);
        }
        let upload_dir = self.layout.upload_dir(owner_id, &req.upload_id);
        if !fs::try_exists(&upload_dir).await.unwrap_or(false) {
            return Ok(UploadProgress::Pending);
        }
        if !self
            .is_complete(owner_id, &req.upload_id, req.total_chunks)
            .await
        {
            return Ok(UploadProgress::Pending);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(upload_dir.join(CLAIM_MARKER))
            .await
        {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(upload_id = %req.upload_id, "assembly already claimed");
                return Ok(UploadProgress::Pending);
            }
            Err(err) => return Err(UploadError::Io(err)),
        }

        let assembled = self
            .assemble(
                owner_id,
                &req.parent_path,
                &req.file_name,
                &req.upload_id,
                req.total_chunks,
            )
            .await;
        if assembled.is_err() {
            // a resent chunk may retry
            if let Err(err) = fs::remove_file(upload_dir.join(CLAIM_MARKER)).await {
                debug!("could not release claim on {}: {}", upload_dir.display(), err);
            }
        }
        assembled?;
        Ok(UploadProgress::Assembled)
    }

    async fn is_assembled(&self, owner_id: &str, upload_id: &str) -> bool {
        fs::try_exists(self.layout.completion_record(owner_id, upload_id))
            .await
            .unwrap_or(false)
    }

    async fn record_completion(
        &self,
        owner_id: &str,
        upload_id: &str,
        total_bytes: u64,
    ) -> io::Result<()> {
        fs::create_dir_all(self.layout.completed_dir(owner_id)).await?;
        fs::write(
            self.layout.completion_record(owner_id, upload_id),
            total_bytes.to_string(),
        )
        .await
    }

    fn lock_for(&self, key: &UploadKey) -> Arc<RwLock<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    fn release(&self, key: &UploadKey, lock: Arc<RwLock<()>>) {
        drop(lock);
        self.locks
            .remove_if(key, |_, existing| Arc::strong_count(existing) == 1);
    }

    #[cfg(test)]
    fn is_locked(&self, key: &UploadKey) -> bool {
        self.locks.contains_key(key)
    }

    /// Remove upload directories not modified within `max_age`, along with
    /// completion records older than `max_age`.
    ///
    /// Each removal holds the upload's exclusive lock; uploads with a chunk
    /// write or completion check in flight are skipped. Returns how many
    /// upload directories were removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> io::Result<usize> {
        let chunks_root = self.layout.chunks_root();
        let mut owners = match fs::read_dir(&chunks_root).await {
            Ok(owners) => owners,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(owner) = owners.next_entry().await? {
            if !owner.file_type().await?.is_dir() {
                continue;
            }
            let owner_id = owner.file_name().to_string_lossy().into_owned();
            let mut uploads = fs::read_dir(owner.path()).await?;

            while let Some(upload) = uploads.next_entry().await? {
                let upload_id = upload.file_name().to_string_lossy().into_owned();
                if upload_id == COMPLETED_DIR {
                    sweep_completion_records(&upload.path(), max_age, now).await;
                    continue;
                }

                let key = (owner_id.clone(), upload_id.clone());
                let lock = self.lock_for(&key);
                let swept = match lock.try_write() {
                    Ok(_exclusive) => remove_if_stale(&upload.path(), max_age, now).await,
                    Err(_) => {
                        debug!(
                            owner_id = %owner_id,
                            upload_id = %upload_id,
                            "upload busy, not swept"
                        );
                        Ok(None)
                    }
                };
                self.release(&key, lock);

                if let Some(age) = swept? {
                    removed += 1;
                    info!(
                        owner_id = %owner_id,
                        upload_id = %upload_id,
                        age_secs = age.as_secs(),
                        "removed abandoned upload"
                    );
                }
            }

            prune_empty_dirs(&owner.path(), &chunks_root).await;
        }

        Ok(removed)
    }
}

fn age_of(meta: &std::fs::Metadata, now: SystemTime) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .unwrap_or_default()
}

/// Remove one upload directory if it is older than `max_age`; returns its age when removed.
async fn remove_if_stale(
    upload_dir: &Path,
    max_age: Duration,
    now: SystemTime,
) -> io::Result<Option<Duration>> {
    let meta = match fs::metadata(upload_dir).await {
        Ok(meta) if meta.is_dir() => meta,
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let age = age_of(&meta, now);
    if age < max_age {
        return Ok(None);
    }

    match fs::remove_dir_all(upload_dir).await {
        Ok(_) => Ok(Some(age)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            warn!(
                "failed to remove abandoned upload {}: {}",
                upload_dir.display(),
                err
            );
            Ok(None)
        }
    }
}

async fn sweep_completion_records(dir: &Path, max_age: Duration, now: SystemTime) {
    let mut records = match fs::read_dir(dir).await {
        Ok(records) => records,
        Err(err) => {
            debug!("cannot read completion records in {}: {}", dir.display(), err);
            return;
        }
    };
    while let Ok(Some(record)) = records.next_entry().await {
        let stale = record
            .metadata()
            .await
            .map(|meta| age_of(&meta, now) >= max_age)
            .unwrap_or(false);
        if stale {
            if let Err(err) = fs::remove_file(record.path()).await {
                debug!("failed to remove {}: {}", record.path().display(), err);
            }
        }
    }
    // fails while records remain
    let _ = fs::remove_dir(dir).await;
}

async fn append_chunk(chunk_path: &Path, dest: &mut File) -> io::Result<u64> {
    let mut chunk = File::open(chunk_path).await?;
    copy_buffered(&mut chunk, dest).await
}

/// Remove empty directories from `start` upward, stopping below `stop`.
///
/// Stops when:
/// - directory not empty
/// - directory not found
/// - reached `stop`
/// - encountered unexpected I/O errors
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}
