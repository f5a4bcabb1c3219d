use std::path::PathBuf;

pub const SYSTEM_SOCKET_PATH: &str = "/run/faceguard/daemon.sock";

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/faceguard/config.toml")
}

pub fn system_models_dir() -> PathBuf {
    PathBuf::from("/usr/share/faceguard/models")
}

pub fn system_log_dir() -> PathBuf {
    PathBuf::from("/var/log/faceguard")
}

pub fn system_templates_dir() -> PathBuf {
    PathBuf::from("/var/lib/faceguard/templates")
}
