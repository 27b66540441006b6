//! State-root resolution: `KITT_HOME` env, else `~/.kitt`.

use std::path::PathBuf;

use crate::LoadError;

/// Resolves the kitt home directory without creating it.
pub fn kitt_home() -> Result<PathBuf, LoadError> {
    if let Ok(p) = std::env::var("KITT_HOME") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".kitt"))
        .ok_or_else(|| LoadError::HomePath("no home directory for this user".to_string()))
}

/// Resolves the home directory and creates the standard subtree:
/// `certs/`, `logs/`, `models/`.
pub fn ensure_home() -> Result<PathBuf, LoadError> {
    let home = kitt_home()?;
    for sub in ["certs", "logs", "models"] {
        std::fs::create_dir_all(home.join(sub)).map_err(LoadError::HomeCreate)?;
    }
    Ok(home)
}

/// Default embedded database path: `<home>/kitt.db`.
pub fn default_db_path() -> Result<PathBuf, LoadError> {
    Ok(kitt_home()?.join("kitt.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn kitt_home_env_wins() {
        let _env = crate::test_env_lock();
        let dir = tempfile::tempdir().unwrap();
        let prev = env::var("KITT_HOME").ok();
        env::set_var("KITT_HOME", dir.path());
        let home = kitt_home().unwrap();
        match prev {
            Some(p) => env::set_var("KITT_HOME", p),
            None => env::remove_var("KITT_HOME"),
        }
        assert_eq!(home, dir.path());
    }

    #[test]
    fn ensure_home_creates_subtree() {
        let _env = crate::test_env_lock();
        let dir = tempfile::tempdir().unwrap();
        let prev = env::var("KITT_HOME").ok();
        env::set_var("KITT_HOME", dir.path());
        let home = ensure_home().unwrap();
        match prev {
            Some(p) => env::set_var("KITT_HOME", p),
            None => env::remove_var("KITT_HOME"),
        }
        assert!(home.join("certs").is_dir());
        assert!(home.join("logs").is_dir());
        assert!(home.join("models").is_dir());
    }
}
