use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

pub const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;
/// Longest stem kept from a client file name. Leaves room for the uuid
/// suffix and the `improved_` prefix within a 255 byte file name.
pub const MAX_STEM_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no file selected")]
    EmptyFilename,
    #[error("file type not allowed: {0:?}")]
    InvalidFormat(String),
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },
    #[error("uploaded file is empty")]
    EmptyPayload,
    #[error(transparent)]
    Storage(#[from] super::StorageError),
}

/// Which uploads are accepted and how they are renamed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub allowed_extensions: Vec<String>,
    pub max_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: ["png", "jpg", "jpeg", "gif"].map(String::from).to_vec(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Reduces a client supplied file name to a safe single path component.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; whitespace becomes `_`,
/// everything else is dropped, and leading dots are stripped.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

impl UploadPolicy {
    /// Returns the lowercase extension of `filename` if it is allowed.
    pub fn extract_file_extension(&self, filename: &str) -> Result<String, UploadError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| UploadError::InvalidFormat(filename.to_string()))?;
        if self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            Ok(extension)
        } else {
            Err(UploadError::InvalidFormat(filename.to_string()))
        }
    }

    pub fn validate_image_size(&self, image_data: &[u8]) -> Result<(), UploadError> {
        if image_data.is_empty() {
            return Err(UploadError::EmptyPayload);
        }
        if image_data.len() > self.max_bytes {
            return Err(UploadError::FileTooLarge {
                size: image_data.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Builds the collision-proof `"{stem}_{uuid}.{ext}"` name for an upload.
    pub fn generate_stored_name(&self, filename: &str) -> Result<String, UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::EmptyFilename);
        }
        let safe = sanitize_filename(filename);
        let extension = self.extract_file_extension(&safe)?;
        let stem = Path::new(&safe)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        // sanitized names are ASCII, so this cuts on a char boundary
        let stem = &stem[..stem.len().min(MAX_STEM_CHARS)];
        Ok(format!("{}_{}.{}", stem, Uuid::new_v4(), extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_only_safe_characters() {
        assert_eq!(sanitize_filename("chest x-ray.png"), "chest_x-ray.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\scans\\lung.JPG"), "lung.JPG");
        assert_eq!(sanitize_filename("..hidden.gif"), "hidden.gif");
        assert_eq!(sanitize_filename("résumé.png"), "rsum.png");
    }

    #[test]
    fn only_listed_extensions_are_accepted() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.extract_file_extension("scan.PNG").unwrap(), "png");
        assert_eq!(policy.extract_file_extension("scan.jpeg").unwrap(), "jpeg");
        assert!(matches!(
            policy.extract_file_extension("scan.bmp"),
            Err(UploadError::InvalidFormat(_))
        ));
        assert!(policy.extract_file_extension("scan").is_err());
    }

    #[test]
    fn size_limit_is_inclusive() {
        let policy = UploadPolicy {
            max_bytes: 4,
            ..UploadPolicy::default()
        };
        assert!(policy.validate_image_size(&[0; 4]).is_ok());
        assert!(matches!(
            policy.validate_image_size(&[0; 5]),
            Err(UploadError::FileTooLarge { size: 5, limit: 4 })
        ));
        assert!(matches!(policy.validate_image_size(&[]), Err(UploadError::EmptyPayload)));
    }

    #[test]
    fn stored_names_are_unique_and_keep_the_stem() {
        let policy = UploadPolicy::default();
        let a = policy.generate_stored_name("my scan.Png").unwrap();
        let b = policy.generate_stored_name("my scan.Png").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("my_scan_"));
        assert!(a.ends_with(".png"));
        // stem + '_' + 36 character uuid + ".png"
        assert_eq!(a.len(), "my_scan".len() + 1 + 36 + 4);
    }

    #[test]
    fn long_stems_are_truncated() {
        let policy = UploadPolicy::default();
        let stored = policy
            .generate_stored_name(&format!("{}.png", "s".repeat(170)))
            .unwrap();
        assert!(stored.starts_with(&format!("{}_", "s".repeat(MAX_STEM_CHARS))));
        assert_eq!(stored.len(), MAX_STEM_CHARS + 1 + 36 + 4);
        assert!(format!("improved_{stored}").len() < 255);
    }

    #[test]
    fn empty_or_unsafe_names_are_rejected() {
        let policy = UploadPolicy::default();
        assert!(matches!(policy.generate_stored_name("  "), Err(UploadError::EmptyFilename)));
        assert!(policy.generate_stored_name("???").is_err());
    }
}
