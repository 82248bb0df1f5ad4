//! Lazy, single-attempt model loading shared by every request.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use ndarray::Array4;

use crate::arch::{ArchitectureDescriptor, SuperResolution};
use crate::checkpoint::CheckpointError;
use crate::nn::ShapeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unavailable,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Unavailable => "unavailable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model is not ready")]
    ModelNotReady,
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Produces the network the manager will serve.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn SuperResolution>, CheckpointError>;

    /// Human readable origin of the model, used in logs.
    fn describe(&self) -> String {
        "model".to_string()
    }
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Box<dyn SuperResolution>, CheckpointError> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn SuperResolution>, CheckpointError> {
        self()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum Slot {
    Unloaded,
    Loading,
    Ready(Arc<dyn SuperResolution>),
    Unavailable(String),
}

impl Slot {
    fn state(&self) -> ModelState {
        match self {
            Slot::Unloaded => ModelState::Unloaded,
            Slot::Loading => ModelState::Loading,
            Slot::Ready(_) => ModelState::Ready,
            Slot::Unavailable(_) => ModelState::Unavailable,
        }
    }
}

struct Inner {
    slot: Slot,
    attempts: usize,
}

/// Owns the served network.
///
/// The first caller of [`warmup`](Self::warmup) runs the loader while every
/// concurrent caller waits for its outcome. A failed load is final for the
/// lifetime of the manager.
pub struct ModelManager {
    loader: Box<dyn ModelLoader>,
    inner: Mutex<Inner>,
    loaded: Condvar,
}

impl ModelManager {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            inner: Mutex::new(Inner {
                slot: Slot::Unloaded,
                attempts: 0,
            }),
            loaded: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // slot updates are single assignments, so a poisoned guard is still coherent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads the model if nobody has tried yet and returns the settled state.
    pub fn warmup(&self) -> ModelState {
        let mut inner = self.lock();
        loop {
            match inner.slot.state() {
                ModelState::Unloaded => break,
                ModelState::Loading => {
                    inner = self
                        .loaded
                        .wait(inner)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                settled => return settled,
            }
        }

        inner.slot = Slot::Loading;
        inner.attempts += 1;
        drop(inner);

        let source = self.loader.describe();
        log::info!("Loading super-resolution model from {source}");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load()));
        let slot = match outcome {
            Ok(Ok(model)) => {
                let descriptor = model.descriptor();
                log::info!(
                    "Model ready: {} architecture, x{} scale",
                    descriptor.kind,
                    descriptor.scale_factor
                );
                Slot::Ready(Arc::from(model))
            }
            Ok(Err(e)) => {
                log::warn!("Model from {source} is unavailable, serving fallback copies: {e}");
                Slot::Unavailable(e.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                log::error!("Loading model from {source} panicked, serving fallback copies: {reason}");
                Slot::Unavailable(format!("model loader panicked: {reason}"))
            }
        };

        let mut inner = self.lock();
        inner.slot = slot;
        let state = inner.slot.state();
        drop(inner);
        self.loaded.notify_all();
        state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    pub fn state(&self) -> ModelState {
        self.lock().slot.state()
    }

    pub fn descriptor(&self) -> Option<ArchitectureDescriptor> {
        self.model().map(|model| model.descriptor())
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        match &self.lock().slot {
            Slot::Unavailable(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Number of times the loader has been invoked.
    pub fn load_attempts(&self) -> usize {
        self.lock().attempts
    }

    fn model(&self) -> Option<Arc<dyn SuperResolution>> {
        match &self.lock().slot {
            Slot::Ready(model) => Some(Arc::clone(model)),
            _ => None,
        }
    }

    /// Runs the served network on a `(1, H, W, C)` batch, loading it first if needed.
    pub fn infer(&self, batch: &Array4<f32>) -> Result<Array4<f32>, InferenceError> {
        self.warmup();
        let model = self.model().ok_or(InferenceError::ModelNotReady)?;
        Ok(model.infer(batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, ArchitectureKind};
    use crate::nn::Initializer;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn untrained() -> Result<Box<dyn SuperResolution>, CheckpointError> {
        Ok(arch::build(
            ArchitectureDescriptor::new(ArchitectureKind::Enhanced),
            &mut Initializer::default(),
        )?)
    }

    #[test]
    fn starts_unloaded_and_loads_once() {
        let manager = ModelManager::new(untrained);
        assert_eq!(manager.state(), ModelState::Unloaded);
        assert_eq!(manager.descriptor(), None);

        assert_eq!(manager.warmup(), ModelState::Ready);
        assert_eq!(manager.warmup(), ModelState::Ready);
        assert!(manager.is_ready());
        assert_eq!(manager.load_attempts(), 1);
        assert_eq!(
            manager.descriptor().map(|d| d.kind),
            Some(ArchitectureKind::Enhanced)
        );
    }

    #[test]
    fn concurrent_warmups_share_one_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let manager = Arc::new(ModelManager::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            untrained()
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.warmup())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), ModelState::Ready);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.load_attempts(), 1);
    }

    #[test]
    fn failed_load_is_never_retried() {
        let manager = ModelManager::new(|| -> Result<Box<dyn SuperResolution>, CheckpointError> {
            Err(CheckpointError::NotFound(PathBuf::from("missing.safetensors")))
        });

        assert_eq!(manager.warmup(), ModelState::Unavailable);
        assert_eq!(manager.warmup(), ModelState::Unavailable);
        assert_eq!(manager.load_attempts(), 1);
        assert!(manager.unavailable_reason().unwrap().contains("missing.safetensors"));
    }

    #[test]
    fn panicking_loader_settles_as_unavailable() {
        let manager = Arc::new(ModelManager::new(
            || -> Result<Box<dyn SuperResolution>, CheckpointError> { panic!("corrupt weights") },
        ));

        assert_eq!(manager.warmup(), ModelState::Unavailable);
        assert_eq!(manager.warmup(), ModelState::Unavailable);
        assert_eq!(manager.load_attempts(), 1);
        assert!(manager.unavailable_reason().unwrap().contains("corrupt weights"));

        // other threads must not block on a load that unwound
        let waiter = Arc::clone(&manager);
        let state = thread::spawn(move || waiter.warmup()).join().unwrap();
        assert_eq!(state, ModelState::Unavailable);
        let batch = Array4::<f32>::zeros((1, 2, 2, 1));
        assert!(matches!(manager.infer(&batch), Err(InferenceError::ModelNotReady)));
    }

    #[test]
    fn infer_without_model_reports_not_ready() {
        let manager = ModelManager::new(|| -> Result<Box<dyn SuperResolution>, CheckpointError> {
            Err(CheckpointError::Format("truncated".to_string()))
        });
        let batch = Array4::<f32>::zeros((1, 2, 2, 1));
        assert!(matches!(manager.infer(&batch), Err(InferenceError::ModelNotReady)));
    }

    #[test]
    fn infer_loads_lazily() {
        let manager = ModelManager::new(untrained);
        let out = manager.infer(&Array4::<f32>::zeros((1, 2, 3, 1))).unwrap();
        assert_eq!(out.dim(), (1, 8, 12, 1));
        assert_eq!(manager.state(), ModelState::Ready);
        assert_eq!(manager.load_attempts(), 1);
    }
}
