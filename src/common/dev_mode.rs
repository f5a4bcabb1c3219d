use std::fs;
use std::path::PathBuf;
use crate::common::config::Config;
use crate::common::error::Result;
use crate::common::paths;

/// Local-directory layout used with `--dev`, so nothing touches /etc, /run or /var.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub const DEV_SOCKET_PATH: &'static str = "/tmp/faceguard.sock";

    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from("./dev_data")
        } else {
            PathBuf::new()
        };

        if enabled {
            fs::create_dir_all(base_dir.join("logs"))?;
            fs::create_dir_all(base_dir.join("models"))?;
            fs::create_dir_all(base_dir.join("templates"))?;
            tracing::info!("Development mode enabled, data under {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config_file(&self) -> PathBuf {
        if self.enabled {
            PathBuf::from("./configs/faceguard.toml")
        } else {
            paths::system_config_file()
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("logs")
        } else {
            paths::system_log_dir()
        }
    }

    pub fn templates_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("templates")
        } else {
            paths::system_templates_dir()
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("models")
        } else {
            paths::system_models_dir()
        }
    }

    /// Loads the config for this mode. A missing dev config falls back to defaults
    /// rewritten onto the dev layout.
    pub fn load_config(&self) -> Result<Config> {
        let path = self.config_file();
        let mut config = if self.enabled && !path.exists() {
            tracing::warn!("No dev config at {}, using defaults", path.display());
            Config::default()
        } else {
            Config::load_from_path(&path)?
        };

        if self.enabled {
            self.apply(&mut config);
        }
        Ok(config)
    }

    fn apply(&self, config: &mut Config) {
        if config.daemon.socket_path == PathBuf::from(paths::SYSTEM_SOCKET_PATH) {
            config.daemon.socket_path = PathBuf::from(Self::DEV_SOCKET_PATH);
        }
        if config.attempt_log.dir == paths::system_log_dir() {
            config.attempt_log.dir = self.logs_dir();
        }
        if config.templates.dir == paths::system_templates_dir() {
            config.templates.dir = self.templates_dir();
        }
        let models = self.models_dir();
        let system_models = paths::system_models_dir();
        for path in [
            &mut config.models.detector_path,
            &mut config.models.landmark_path,
            &mut config.models.recognizer_path,
        ] {
            if let Ok(file) = path.strip_prefix(&system_models) {
                *path = models.join(file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_layout_rewrites_system_paths() {
        let dev = DevMode { enabled: true, base_dir: PathBuf::from("./dev_data") };
        let mut config = Config::default();
        dev.apply(&mut config);

        assert_eq!(config.daemon.socket_path, PathBuf::from(DevMode::DEV_SOCKET_PATH));
        assert_eq!(config.attempt_log.dir, PathBuf::from("./dev_data/logs"));
        assert!(config.models.detector_path.starts_with("./dev_data/models"));
        assert_eq!(config.templates.dir, PathBuf::from("./dev_data/templates"));
    }

    #[test]
    fn explicit_paths_survive_dev_layout() {
        let dev = DevMode { enabled: true, base_dir: PathBuf::from("./dev_data") };
        let mut config = Config::default();
        config.daemon.socket_path = PathBuf::from("/tmp/custom.sock");
        dev.apply(&mut config);

        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/custom.sock"));
    }
}
