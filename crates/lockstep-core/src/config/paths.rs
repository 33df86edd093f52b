//! Standard configuration locations

use std::path::PathBuf;

/// Configuration directory: `<platform config dir>/lockstep`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lockstep")
}

/// Default engine config file: `<config dir>/lockstep/engine.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("engine.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_layout() {
        let path = default_config_path();
        assert!(path.ends_with("lockstep/engine.yaml"));
        assert_eq!(path.parent(), Some(config_dir().as_path()));
    }
}
