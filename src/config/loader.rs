use std::path::Path;

use super::types::RuntimeConfig;
use crate::log_warn;

impl RuntimeConfig {
    /// Loads configuration from a TOML file, falling back to defaults for any
    /// field the file omits (and for the whole struct if the file is absent).
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log_warn!("config at {} failed to parse ({e}); using defaults", path.display());
                    RuntimeConfig::default()
                }
            },
            Err(_) => RuntimeConfig::default(),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Locates the OS-standard per-user config file for this application
    /// (`<config_dir>/<app_name>/concord.toml`) and loads it, falling back to
    /// defaults if no config directory can be determined or the file doesn't
    /// exist — mirrors the teacher's `gui/src-tauri/src/config` loader, which
    /// resolves the same way via `dirs::config_dir()`.
    pub fn load_default(app_name: &str) -> Self {
        match dirs::config_dir() {
            Some(dir) => Self::load(dir.join(app_name).join("concord.toml")),
            None => {
                log_warn!("could not determine OS config directory; using defaults");
                RuntimeConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = RuntimeConfig::load("/nonexistent/concord.toml");
        assert_eq!(cfg.application_name, "concord");
        assert_eq!(cfg.clock.window, 5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concord.toml");
        std::fs::write(&path, "application_name = \"studio\"\n").unwrap();
        let cfg = RuntimeConfig::load(&path);
        assert_eq!(cfg.application_name, "studio");
        assert_eq!(cfg.network.discovery_port, 45_678);
    }

    #[test]
    fn load_default_falls_back_when_no_such_app_config_exists() {
        let cfg = RuntimeConfig::load_default("concord_test_app_that_does_not_exist");
        assert_eq!(cfg.application_name, "concord");
    }
}
