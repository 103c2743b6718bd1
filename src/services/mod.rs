//! Storage-side services shared by every handler.

pub mod chunk_service;
pub mod file_model;
pub mod staged_file;
pub mod storage_layout;

use chunk_service::ChunkService;
use file_model::{DirectoryModel, FileModel};
use std::path::PathBuf;
use storage_layout::StorageLayout;

/// Router state: the chunk engine plus the file and directory models,
/// all resolving paths against the same storage root.
#[derive(Clone)]
pub struct AppState {
    pub chunks: ChunkService,
    pub files: FileModel,
    pub directories: DirectoryModel,
}

impl AppState {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let layout = StorageLayout::new(storage_root);
        Self {
            chunks: ChunkService::new(layout.clone()),
            files: FileModel::new(layout.clone()),
            directories: DirectoryModel::new(layout),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        self.chunks.layout()
    }
}
