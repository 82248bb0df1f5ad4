use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use super::{ImageStore, Namespace, StorageError};

/// Keeps images as plain files under `<root>/original` and `<root>/improved`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store, creating both namespace directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for namespace in [Namespace::Original, Namespace::Improved] {
            fs::create_dir_all(root.join(namespace.dir_name()))?;
        }
        log::debug!("Image store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate(name: &str) -> Result<(), StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None)
                if part == name && !name.contains(['/', '\\']) =>
            {
                Ok(())
            }
            _ => Err(StorageError::InvalidName(name.to_string())),
        }
    }
}

impl ImageStore for FileStore {
    /// Writes through a temporary sibling and renames it into place, so readers
    /// never see a half-written image.
    fn save(&self, namespace: Namespace, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.path_of(namespace, name)?;
        let staging = target.with_file_name(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&staging)?;
        let written = file.write_all(bytes).and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written.and_then(|_| fs::rename(&staging, &target)) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    fn exists(&self, namespace: Namespace, name: &str) -> bool {
        self.path_of(namespace, name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn load(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(namespace, name)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
            _ => StorageError::Io(e),
        })
    }

    fn path_of(&self, namespace: Namespace, name: &str) -> Result<PathBuf, StorageError> {
        Self::validate(name)?;
        Ok(self.root.join(namespace.dir_name()).join(name))
    }
}
