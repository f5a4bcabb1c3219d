use crate::common::{FaceAuthError, Result};
use crate::core::types::FaceDescriptor;
use crate::service::stats::StatsRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// One enrolled model as stored on disk. A model may hold several descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledModel {
    pub label: String,
    #[serde(default)]
    pub time: Option<u64>,
    pub data: Vec<Vec<f32>>,
}

struct CachedTemplates {
    modified: SystemTime,
    descriptors: Arc<Vec<FaceDescriptor>>,
}

/// Enrolled descriptors per user, read from `<dir>/<user>.json` and kept
/// until the file changes or the entry is invalidated.
pub struct TemplateCache {
    dir: PathBuf,
    entries: Mutex<HashMap<String, CachedTemplates>>,
    stats: Arc<StatsRegistry>,
}

impl TemplateCache {
    pub fn new(dir: impl Into<PathBuf>, stats: Arc<StatsRegistry>) -> Self {
        Self { dir: dir.into(), entries: Mutex::new(HashMap::new()), stats }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedTemplates>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn path_for(&self, user: &str) -> Result<PathBuf> {
        validate_user(user)?;
        Ok(self.dir.join(format!("{}.json", user)))
    }

    /// All descriptors enrolled for `user`. A file newer than the cached copy
    /// is re-read.
    pub fn get(&self, user: &str) -> Result<Arc<Vec<FaceDescriptor>>> {
        let path = self.path_for(user)?;
        let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.entries().remove(user);
                return Err(FaceAuthError::NotEnrolled(user.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(cached) = self.entries().get(user) {
            if cached.modified >= modified {
                self.stats.record_template_hit();
                return Ok(Arc::clone(&cached.descriptors));
            }
            tracing::debug!(user, "Template file changed, reloading");
        }

        self.stats.record_template_miss();
        let descriptors = Arc::new(load_templates(&path)?);
        if descriptors.is_empty() {
            return Err(FaceAuthError::NotEnrolled(user.to_string()));
        }
        tracing::debug!(user, count = descriptors.len(), "Templates loaded");
        self.entries().insert(
            user.to_string(),
            CachedTemplates { modified, descriptors: Arc::clone(&descriptors) },
        );
        Ok(descriptors)
    }

    /// Drops the cached copy. True if there was one.
    pub fn invalidate(&self, user: &str) -> Result<bool> {
        validate_user(user)?;
        let removed = self.entries().remove(user).is_some();
        tracing::debug!(user, removed, "Template cache invalidated");
        Ok(removed)
    }
}

fn validate_user(user: &str) -> Result<()> {
    if user.is_empty() || user.contains('/') || user.contains('\0') || user.starts_with('.') {
        return Err(FaceAuthError::InvalidRequest(format!("invalid user name {:?}", user)));
    }
    Ok(())
}

fn load_templates(path: &Path) -> Result<Vec<FaceDescriptor>> {
    let contents = fs::read_to_string(path)?;
    let models: Vec<EnrolledModel> = serde_json::from_str(&contents)
        .map_err(|e| FaceAuthError::InvalidRequest(format!("{}: {}", path.display(), e)))?;
    Ok(models
        .into_iter()
        .flat_map(|model| model.data)
        .map(FaceDescriptor)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_models(dir: &Path, user: &str, descriptors: &[Vec<f32>]) {
        let models = vec![EnrolledModel { label: "Initial".into(), time: Some(1), data: descriptors.to_vec() }];
        fs::write(dir.join(format!("{}.json", user)), serde_json::to_string(&models).unwrap()).unwrap();
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::new());
        let cache = TemplateCache::new(dir.path(), stats.clone());
        write_models(dir.path(), "alice", &[vec![0.1, 0.2], vec![0.3, 0.4]]);

        assert_eq!(cache.get("alice").unwrap().len(), 2);
        assert_eq!(cache.get("alice").unwrap()[1].0, vec![0.3, 0.4]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot["template_cache_misses"], 1);
        assert_eq!(snapshot["template_cache_hits"], 1);
    }

    #[test]
    fn rewritten_file_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path(), Arc::new(StatsRegistry::new()));
        write_models(dir.path(), "bob", &[vec![1.0]]);
        assert_eq!(cache.get("bob").unwrap().len(), 1);

        // Coarse filesystem timestamps need a visible gap.
        std::thread::sleep(Duration::from_millis(1100));
        write_models(dir.path(), "bob", &[vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(cache.get("bob").unwrap().len(), 3);
    }

    #[test]
    fn invalidate_forces_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::new());
        let cache = TemplateCache::new(dir.path(), stats.clone());
        write_models(dir.path(), "carol", &[vec![0.5]]);

        cache.get("carol").unwrap();
        assert!(cache.invalidate("carol").unwrap());
        assert!(!cache.invalidate("carol").unwrap());
        cache.get("carol").unwrap();
        assert_eq!(stats.snapshot()["template_cache_misses"], 2);
    }

    #[test]
    fn missing_user_is_not_enrolled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path(), Arc::new(StatsRegistry::new()));
        assert!(matches!(cache.get("nobody"), Err(FaceAuthError::NotEnrolled(_))));

        write_models(dir.path(), "empty", &[]);
        assert!(matches!(cache.get("empty"), Err(FaceAuthError::NotEnrolled(_))));
    }

    #[test]
    fn path_like_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TemplateCache::new(dir.path(), Arc::new(StatsRegistry::new()));
        for name in ["", "../etc/passwd", "a/b", ".hidden"] {
            assert!(matches!(cache.get(name), Err(FaceAuthError::InvalidRequest(_))), "{:?}", name);
        }
    }
}
