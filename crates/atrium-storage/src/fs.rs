//! Narrow async filesystem seam consumed by the metadata store.

use std::io;
use std::path::Path;

use async_trait::async_trait;

/// The persistence operations the store needs, and nothing else. Production
/// uses [`TokioFs`]; tests can substitute a failing or recording impl.
#[async_trait]
pub trait StorageFs: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    async fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn delete(&self, path: &Path, recursive: bool) -> io::Result<()>;
}

/// [`StorageFs`] over `tokio::fs`.
#[derive(Debug, Default)]
pub struct TokioFs;

#[async_trait]
impl StorageFs for TokioFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, contents).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn delete(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_dir(path).await
            }
        } else {
            tokio::fs::remove_file(path).await
        }
    }
}
