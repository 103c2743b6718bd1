//! Write-then-rename helpers shared by chunk receipt, assembly, and direct uploads.
//!
//! Bytes are written to a hidden sibling of the destination, flushed and
//! fsynced, then renamed into place. Readers never observe a half-written
//! destination, and a failed write removes its temporary file.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use uuid::Uuid;

/// Prefix of in-flight temporary files. Listings skip these.
pub const TEMP_PREFIX: &str = ".upload-";

/// Fixed copy buffer; memory per transfer is independent of payload size.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub struct StagedFile {
    tmp_path: PathBuf,
    dest: PathBuf,
    file: File,
}

impl StagedFile {
    /// Create a temporary file next to `dest`, creating parent directories as needed.
    pub async fn create(dest: &Path) -> io::Result<Self> {
        let parent = dest.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "destination has no parent directory")
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok(Self {
            tmp_path,
            dest: dest.to_path_buf(),
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush, fsync and rename onto the destination, replacing any existing file.
    pub async fn commit(mut self) -> io::Result<()> {
        if let Err(err) = self.file.flush().await {
            self.discard().await;
            return Err(err);
        }
        if let Err(err) = self.file.sync_all().await {
            self.discard().await;
            return Err(err);
        }
        let Self { tmp_path, dest, file } = self;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&dest).await?;
                fs::rename(&tmp_path, &dest).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drop the temporary file without touching the destination.
    pub async fn discard(self) {
        let Self { tmp_path, file, .. } = self;
        drop(file);
        if let Err(err) = fs::remove_file(&tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!("failed to remove temp file {}: {}", tmp_path.display(), err);
            }
        }
    }
}

/// Copy `reader` into `writer` through one fixed-size buffer.
pub async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..read]).await?;
        total += read as u64;
    }
}

/// Stage everything `reader` yields and move it onto `dest`.
pub async fn write_atomically<R>(dest: &Path, reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut staged = StagedFile::create(dest).await?;
    match copy_buffered(reader, staged.file_mut()).await {
        Ok(written) => {
            staged.commit().await?;
            Ok(written)
        }
        Err(err) => {
            staged.discard().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_atomically_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/out.bin");

        let written = write_atomically(&dest, &mut &b"first version"[..]).await.unwrap();
        assert_eq!(written, 13);
        write_atomically(&dest, &mut &b"second"[..]).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn discard_leaves_destination_untouched() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("keep.txt");
        std::fs::write(&dest, b"original").unwrap();

        let mut staged = StagedFile::create(&dest).await.unwrap();
        staged.file_mut().write_all(b"partial").await.unwrap();
        staged.discard().await;

        assert_eq!(std::fs::read(&dest).unwrap(), b"original");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn copy_handles_payloads_larger_than_buffer() {
        let data: Vec<u8> = (0..COPY_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let copied = copy_buffered(&mut data.as_slice(), &mut out).await.unwrap();
        assert_eq!(copied as usize, data.len());
        assert_eq!(out, data);
    }
}
