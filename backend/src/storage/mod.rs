pub mod file_store;
pub mod upload;

use std::path::PathBuf;

pub use file_store::FileStore;
pub use upload::{UploadError, UploadPolicy, sanitize_filename};

/// The two flat name spaces the service reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Original,
    Improved,
}

impl Namespace {
    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Original => "original",
            Namespace::Improved => "improved",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid image name: {0:?}")]
    InvalidName(String),
    #[error("{0:?} not found")]
    NotFound(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ImageStore: Send + Sync {
    fn save(&self, namespace: Namespace, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn exists(&self, namespace: Namespace, name: &str) -> bool;

    fn load(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError>;

    fn path_of(&self, namespace: Namespace, name: &str) -> Result<PathBuf, StorageError>;
}
