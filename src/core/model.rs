use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use crate::common::{FaceAuthError, Result};
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet};

/// The opaque recognition capability. Implementations must support
/// concurrent read-only inference.
pub trait FaceModel: Send + Sync {
    /// Zero or more faces, best first.
    fn detect(&self, frame: &Frame) -> Result<Vec<LandmarkSet>>;

    fn encode(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor>;
}

struct Loaded {
    model: Arc<dyn FaceModel>,
    load_time: std::time::Duration,
}

/// Owns the resident model. Loaded once; shared read-only afterwards.
pub struct ModelHost {
    slot: OnceLock<Loaded>,
    /// Serializes loaders so only one of them ever runs.
    loading: Mutex<()>,
}

impl Default for ModelHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelHost {
    pub fn new() -> Self {
        Self { slot: OnceLock::new(), loading: Mutex::new(()) }
    }

    /// Host with an already constructed model.
    pub fn with_model(model: Arc<dyn FaceModel>) -> Self {
        let host = Self::new();
        let _ = host.slot.set(Loaded {
            model,
            load_time: std::time::Duration::ZERO,
        });
        host
    }

    /// Runs `loader` exactly once. A second call is a no-op; a failing loader
    /// leaves the host unloaded and the error is returned to the caller.
    pub fn load<F>(&self, loader: F) -> Result<()>
    where
        F: FnOnce() -> Result<Arc<dyn FaceModel>>,
    {
        if self.slot.get().is_some() {
            return Ok(());
        }
        let _loading = self.loading.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.slot.get().is_some() {
            return Ok(());
        }
        let start = Instant::now();
        let model = loader()?;
        let load_time = start.elapsed();
        if self.slot.set(Loaded { model, load_time }).is_ok() {
            tracing::info!("Models loaded in {:?}", load_time);
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn load_time(&self) -> Option<std::time::Duration> {
        self.slot.get().map(|l| l.load_time)
    }

    pub fn model(&self) -> Result<Arc<dyn FaceModel>> {
        self.slot
            .get()
            .map(|l| Arc::clone(&l.model))
            .ok_or_else(|| FaceAuthError::Model("models are not loaded".into()))
    }

    pub fn detect(&self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        frame.validate()?;
        self.model()?.detect(frame)
    }

    pub fn get_encoding(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        frame.validate()?;
        landmarks.validate()?;
        self.model()?.encode(frame, landmarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point;
    use std::time::SystemTime;

    struct ConstantModel;

    impl FaceModel for ConstantModel {
        fn detect(&self, _frame: &Frame) -> Result<Vec<LandmarkSet>> {
            Ok(vec![LandmarkSet::new(vec![Point::new(1.0, 1.0); 68], 1.0)?])
        }

        fn encode(&self, _frame: &Frame, _landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
            Ok(FaceDescriptor(vec![0.5; 4]))
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 64], 8, 8, 0, SystemTime::now()).unwrap()
    }

    #[test]
    fn unloaded_host_refuses_inference() {
        let host = ModelHost::new();
        assert!(!host.is_loaded());
        assert!(host.detect(&frame()).is_err());
    }

    #[test]
    fn failed_load_leaves_host_unloaded() {
        let host = ModelHost::new();
        let err = host.load(|| Err(FaceAuthError::ModelLoad("missing".into()))).unwrap_err();
        assert!(matches!(err, FaceAuthError::ModelLoad(_)));
        assert!(!host.is_loaded());
    }

    #[test]
    fn loader_runs_once() {
        let host = ModelHost::new();
        host.load(|| Ok(Arc::new(ConstantModel) as Arc<dyn FaceModel>)).unwrap();
        host.load(|| panic!("second load must not run")).unwrap();
        assert!(host.is_loaded());

        let faces = host.detect(&frame()).unwrap();
        let descriptor = host.get_encoding(&frame(), &faces[0]).unwrap();
        assert_eq!(descriptor.len(), 4);
    }

    #[test]
    fn concurrent_loaders_load_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let host = Arc::new(ModelHost::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let host = Arc::clone(&host);
                let loads = Arc::clone(&loads);
                std::thread::spawn(move || {
                    host.load(|| {
                        loads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(Arc::new(ConstantModel) as Arc<dyn FaceModel>)
                    })
                    .unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(host.is_loaded());
    }

    #[test]
    fn malformed_landmarks_are_invalid_requests() {
        let host = ModelHost::with_model(Arc::new(ConstantModel));
        let bad = LandmarkSet { points: vec![Point::new(0.0, 0.0); 3], confidence: 1.0 };
        let err = host.get_encoding(&frame(), &bad).unwrap_err();
        assert!(matches!(err, FaceAuthError::InvalidRequest(_)));
    }
}
