//! Load the `[env]` table from `<kitt home>/config.toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::LoadError;

fn config_path(home: &Path) -> Option<PathBuf> {
    let path = home.join("config.toml");
    path.is_file().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns env key-value pairs from the `[env]` section. Missing file or
/// empty section returns an empty map.
pub fn load_env_map(home: &Path) -> Result<HashMap<String, String>, LoadError> {
    let path = match config_path(home) {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::ConfigRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_env_map(dir.path()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn load_env_map_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[env]
KITT_AUTH_TOKEN = "secret"
KITT_DB_DSN = "postgres://kitt@db/kitt"
"#,
        )
        .unwrap();
        let map = load_env_map(dir.path()).unwrap();
        assert_eq!(map.get("KITT_AUTH_TOKEN"), Some(&"secret".to_string()));
        assert_eq!(
            map.get("KITT_DB_DSN"),
            Some(&"postgres://kitt@db/kitt".to_string())
        );
    }

    #[test]
    fn invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not valid toml [[[\n").unwrap();
        let result = load_env_map(dir.path());
        assert!(matches!(result, Err(LoadError::ConfigParse(_))));
    }

    #[test]
    fn config_without_env_section_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[other]\nkey = \"ignored\"\n").unwrap();
        let map = load_env_map(dir.path()).unwrap();
        assert!(map.is_empty());
    }
}
