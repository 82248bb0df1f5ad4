//! Persisted architecture + weights bundles.
//!
//! A checkpoint is a safetensors file whose metadata names the architecture
//! (`architecture`, `scale_factor`, `channels`) and whose tensors are
//! little-endian F32 values keyed by layer path, e.g. `body.3.conv1.weight`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::ArrayViewD;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::arch::{
    self, ArchitectureDescriptor, ArchitectureError, ArchitectureKind, DEFAULT_CHANNELS,
    DEFAULT_SCALE_FACTOR, SuperResolution,
};
use crate::lifecycle::ModelLoader;
use crate::nn::{Initializer, ParamError, WeightFile};

const ARCHITECTURE_KEY: &str = "architecture";
const SCALE_FACTOR_KEY: &str = "scale_factor";
const CHANNELS_KEY: &str = "channels";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoint at {}", .0.display())]
    NotFound(PathBuf),
    #[error("could not read checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("malformed checkpoint: {0}")]
    Format(String),
    #[error("checkpoint lacks tensor `{0}`")]
    MissingTensor(String),
    #[error("tensor `{name}` has shape {got:?}, the architecture needs {expected:?}")]
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("tensor `{name}` is stored as {dtype}, only F32 is supported")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("checkpoint was built for {found:?}, expected {expected:?}")]
    Incompatible {
        expected: ArchitectureDescriptor,
        found: ArchitectureDescriptor,
    },
    #[error(transparent)]
    Architecture(#[from] ArchitectureError),
}

fn format_error(err: impl std::fmt::Debug) -> CheckpointError {
    CheckpointError::Format(format!("{err:?}"))
}

fn weights_error(err: ArchitectureError) -> CheckpointError {
    match err {
        ArchitectureError::Params(ParamError::Missing(name)) => CheckpointError::MissingTensor(name),
        ArchitectureError::Params(ParamError::Shape {
            name,
            got,
            expected,
        }) => CheckpointError::ShapeMismatch {
            name,
            got,
            expected,
        },
        other => CheckpointError::Architecture(other),
    }
}

/// Writes `model` and its descriptor to `path`.
pub fn save_checkpoint(path: &Path, model: &dyn SuperResolution) -> Result<(), CheckpointError> {
    let mut tensors: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    model.visit_params(&mut |name: &str, view: ArrayViewD<'_, f32>| {
        let bytes = view.iter().flat_map(|v| v.to_le_bytes()).collect();
        tensors.push((name.to_string(), view.shape().to_vec(), bytes));
    });

    let views = tensors
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(format_error)?;

    let descriptor = model.descriptor();
    let metadata = HashMap::from([
        (ARCHITECTURE_KEY.to_string(), descriptor.kind.to_string()),
        (SCALE_FACTOR_KEY.to_string(), descriptor.scale_factor.to_string()),
        (CHANNELS_KEY.to_string(), descriptor.channels.to_string()),
    ]);

    let bytes = safetensors::serialize(views.iter().map(|(name, view)| (*name, view)), &Some(metadata))
        .map_err(format_error)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), CheckpointError> {
    let actual = blake3::hash(bytes).to_hex().to_string();
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(CheckpointError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn read_usize(info: &HashMap<String, String>, key: &str, default: usize) -> Result<usize, CheckpointError> {
    match info.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| CheckpointError::Format(format!("`{key}` is not an integer: {raw}"))),
    }
}

fn descriptor_from(info: &HashMap<String, String>) -> Result<ArchitectureDescriptor, CheckpointError> {
    let kind: ArchitectureKind = info
        .get(ARCHITECTURE_KEY)
        .ok_or_else(|| CheckpointError::Format(format!("missing `{ARCHITECTURE_KEY}` metadata")))?
        .parse()
        .map_err(|_| CheckpointError::Format(format!("unknown architecture `{}`", info[ARCHITECTURE_KEY])))?;

    Ok(ArchitectureDescriptor::new(kind)
        .with_scale_factor(read_usize(info, SCALE_FACTOR_KEY, DEFAULT_SCALE_FACTOR)?)
        .with_channels(read_usize(info, CHANNELS_KEY, DEFAULT_CHANNELS)?))
}

/// Reads a checkpoint and rebuilds the network it describes.
///
/// Every tensor the architecture expects must be present with the right
/// shape, and no extra tensors may be left over.
pub fn load_checkpoint(path: &Path, checksum: Option<&str>) -> Result<Box<dyn SuperResolution>, CheckpointError> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    if let Some(expected) = checksum {
        verify_checksum(&bytes, expected)?;
    }

    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(format_error)?;
    let info = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| CheckpointError::Format("missing metadata".to_string()))?;
    let descriptor = descriptor_from(info)?;

    let tensors = SafeTensors::deserialize(&bytes).map_err(format_error)?;
    let mut weights = WeightFile::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(CheckpointError::UnsupportedDtype {
                name,
                dtype: format!("{:?}", view.dtype()),
            });
        }
        let data = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        weights.insert(name, view.shape().to_vec(), data);
    }

    let model = arch::build(descriptor, &mut weights).map_err(weights_error)?;
    weights
        .finish()
        .map_err(|e| weights_error(ArchitectureError::from(e)))?;
    Ok(model)
}

/// Loads the configured checkpoint for the [`ModelManager`](crate::lifecycle::ModelManager).
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    path: PathBuf,
    descriptor: ArchitectureDescriptor,
    checksum: Option<String>,
    allow_untrained: bool,
}

impl CheckpointLoader {
    pub fn new(path: impl Into<PathBuf>, descriptor: ArchitectureDescriptor) -> Self {
        Self {
            path: path.into(),
            descriptor,
            checksum: None,
            allow_untrained: false,
        }
    }

    /// Expected BLAKE3 digest (hex) of the checkpoint file.
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Build a freshly initialized network when the checkpoint file is absent.
    pub fn allow_untrained(mut self, allow: bool) -> Self {
        self.allow_untrained = allow;
        self
    }
}

impl ModelLoader for CheckpointLoader {
    fn load(&self) -> Result<Box<dyn SuperResolution>, CheckpointError> {
        let model = match load_checkpoint(&self.path, self.checksum.as_deref()) {
            Ok(model) => model,
            Err(CheckpointError::NotFound(path)) if self.allow_untrained => {
                log::warn!(
                    "No checkpoint at {}, building an untrained {} network",
                    path.display(),
                    self.descriptor.kind
                );
                return Ok(arch::build(self.descriptor, &mut Initializer::default())?);
            }
            Err(e) => return Err(e),
        };

        let found = model.descriptor();
        if found.scale_factor != self.descriptor.scale_factor
            || found.channels != self.descriptor.channels
        {
            return Err(CheckpointError::Incompatible {
                expected: self.descriptor,
                found,
            });
        }
        if found.kind != self.descriptor.kind {
            log::info!(
                "Checkpoint declares the {} architecture, overriding configured {}",
                found.kind,
                self.descriptor.kind
            );
        }
        Ok(model)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ModelManager, ModelState};
    use ndarray::Array4;
    use tempfile::tempdir;

    fn untrained(kind: ArchitectureKind) -> Box<dyn SuperResolution> {
        arch::build(ArchitectureDescriptor::new(kind), &mut Initializer::new(11)).unwrap()
    }

    fn sample_batch() -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 3, 1), |(_, y, x, _)| (y * 3 + x) as f32 / 9.0)
    }

    #[test]
    fn saved_checkpoint_restores_identical_network() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("medical.safetensors");
        let model = untrained(ArchitectureKind::Medical);
        save_checkpoint(&path, model.as_ref()).unwrap();

        let restored = load_checkpoint(&path, None).unwrap();
        assert_eq!(restored.descriptor(), model.descriptor());
        assert_eq!(restored.infer(&sample_batch()).unwrap(), model.infer(&sample_batch()).unwrap());
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let dir = tempdir().unwrap();
        let err = load_checkpoint(&dir.path().join("none.safetensors"), None).err().unwrap();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test]
    fn garbage_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        fs::write(&path, b"definitely not safetensors").unwrap();
        assert!(matches!(
            load_checkpoint(&path, None).err().unwrap(),
            CheckpointError::Format(_)
        ));
    }

    #[test]
    fn checksum_is_verified_when_configured() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enhanced.safetensors");
        save_checkpoint(&path, untrained(ArchitectureKind::Enhanced).as_ref()).unwrap();

        let digest = blake3::hash(&fs::read(&path).unwrap()).to_hex().to_string();
        assert!(load_checkpoint(&path, Some(&digest.to_uppercase())).is_ok());
        assert!(matches!(
            load_checkpoint(&path, Some("00ff")).err().unwrap(),
            CheckpointError::ChecksumMismatch { .. }
        ));
    }

    fn write_single_tensor(path: &Path, name: &str, shape: Vec<usize>) {
        let count: usize = shape.iter().product();
        let data = 0.0f32.to_le_bytes().repeat(count);
        let view = TensorView::new(Dtype::F32, shape, &data).unwrap();
        let metadata = HashMap::from([(ARCHITECTURE_KEY.to_string(), "enhanced".to_string())]);
        let bytes = safetensors::serialize([(name, &view)], &Some(metadata)).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn incomplete_weights_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        write_single_tensor(&path, "head.bias", vec![128]);

        let err = load_checkpoint(&path, None).err().unwrap();
        assert!(matches!(err, CheckpointError::MissingTensor(name) if name == "head.weight"));
    }

    #[test]
    fn misshapen_weights_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("misshapen.safetensors");
        write_single_tensor(&path, "head.weight", vec![128, 1, 3, 3]);

        let err = load_checkpoint(&path, None).err().unwrap();
        assert!(matches!(
            err,
            CheckpointError::ShapeMismatch { expected, .. } if expected == vec![128, 1, 9, 9]
        ));
    }

    #[test]
    fn non_float_tensors_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f16.safetensors");
        let data = vec![0u8; 4];
        let view = TensorView::new(Dtype::F16, vec![2], &data).unwrap();
        let metadata = HashMap::from([(ARCHITECTURE_KEY.to_string(), "enhanced".to_string())]);
        fs::write(&path, safetensors::serialize([("head.bias", &view)], &Some(metadata)).unwrap()).unwrap();

        assert!(matches!(
            load_checkpoint(&path, None).err().unwrap(),
            CheckpointError::UnsupportedDtype { .. }
        ));
    }

    #[test]
    fn overflowing_scale_metadata_leaves_model_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.safetensors");
        let data = 0.0f32.to_le_bytes().repeat(128);
        let view = TensorView::new(Dtype::F32, vec![128], &data).unwrap();
        let metadata = HashMap::from([
            (ARCHITECTURE_KEY.to_string(), "enhanced".to_string()),
            (SCALE_FACTOR_KEY.to_string(), (usize::MAX / 2).to_string()),
        ]);
        fs::write(&path, safetensors::serialize([("head.bias", &view)], &Some(metadata)).unwrap()).unwrap();

        assert!(matches!(
            load_checkpoint(&path, None).err().unwrap(),
            CheckpointError::Architecture(ArchitectureError::ScaleOverflow { .. })
        ));

        let descriptor = ArchitectureDescriptor::default().with_scale_factor(usize::MAX / 2);
        let manager = ModelManager::new(CheckpointLoader::new(&path, descriptor));
        assert_eq!(manager.warmup(), ModelState::Unavailable);
        assert_eq!(manager.warmup(), ModelState::Unavailable);
    }

    #[test]
    fn loader_rejects_scale_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x2.safetensors");
        let descriptor = ArchitectureDescriptor::new(ArchitectureKind::Enhanced).with_scale_factor(2);
        let model = arch::build(descriptor, &mut Initializer::default()).unwrap();
        save_checkpoint(&path, model.as_ref()).unwrap();

        let loader = CheckpointLoader::new(&path, ArchitectureDescriptor::default());
        assert!(matches!(
            loader.load().err().unwrap(),
            CheckpointError::Incompatible { .. }
        ));
    }

    #[test]
    fn loader_prefers_architecture_declared_by_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("srgan.safetensors");
        save_checkpoint(&path, untrained(ArchitectureKind::Srgan).as_ref()).unwrap();

        let model = CheckpointLoader::new(&path, ArchitectureDescriptor::default())
            .load()
            .unwrap();
        assert_eq!(model.descriptor().kind, ArchitectureKind::Srgan);
    }

    #[test]
    fn loader_builds_untrained_network_only_when_allowed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.safetensors");

        let strict = CheckpointLoader::new(&path, ArchitectureDescriptor::default());
        assert!(matches!(strict.load().err().unwrap(), CheckpointError::NotFound(_)));

        let lenient = strict.allow_untrained(true);
        let model = lenient.load().unwrap();
        assert_eq!(model.descriptor(), ArchitectureDescriptor::default());
    }
}
