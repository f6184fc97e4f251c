//! File access used for service descriptions and seed data. Injected so tests and embedders can swap the source.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait FileLoader: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn read_text(&self, path: &Path) -> std::io::Result<String>;
}

/// Reads from the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct FsFileLoader;

#[async_trait]
impl FileLoader for FsFileLoader {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
    }

    async fn read_text(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}

/// Serves files from memory, keyed by path.
#[derive(Clone, Debug, Default)]
pub struct MemoryFileLoader {
    files: HashMap<PathBuf, String>,
}

impl MemoryFileLoader {
    pub fn new() -> Self {
        MemoryFileLoader::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl FileLoader for MemoryFileLoader {
    async fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    async fn read_text(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} not found", path.display()))
        })
    }
}
