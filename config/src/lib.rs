//! Load configuration from `<kitt home>/config.toml` and apply it to the
//! process environment with priority: **existing env > config.toml**.
//!
//! The home directory itself comes from `KITT_HOME` (default `~/.kitt`).

pub mod env;
pub mod home;
mod home_toml;
#[cfg(feature = "tracing-init")]
pub mod tracing_init;

use std::path::Path;
use thiserror::Error;

pub use env::{KittEnv, TlsPaths};
pub use home::{default_db_path, ensure_home, kitt_home};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("kitt home path: {0}")]
    HomePath(String),
    #[error("create kitt home: {0}")]
    HomeCreate(std::io::Error),
    #[error("read config.toml: {0}")]
    ConfigRead(std::io::Error),
    #[error("parse config.toml: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Loads the `[env]` table from `<home>/config.toml` and sets each key that is
/// **not** already present in the process environment (so real env always wins).
///
/// * `override_home`: if `Some`, read `config.toml` from this directory instead
///   of the resolved kitt home (used by tests and `--home` flags).
pub fn load_and_apply(override_home: Option<&Path>) -> Result<(), LoadError> {
    let home = match override_home {
        Some(h) => h.to_path_buf(),
        None => home::kitt_home()?,
    };
    let file_map = home_toml::load_env_map(&home)?;
    for (key, value) in file_map {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

/// Tests across this crate mutate shared process env vars (`KITT_HOME`);
/// they serialize on this lock.
#[cfg(test)]
pub(crate) fn test_env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn existing_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[env]\nKITT_CFG_TEST_EXISTING = \"from_toml\"\n",
        )
        .unwrap();
        env::set_var("KITT_CFG_TEST_EXISTING", "from_env");
        load_and_apply(Some(dir.path())).unwrap();
        assert_eq!(
            env::var("KITT_CFG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("KITT_CFG_TEST_EXISTING");
    }

    #[test]
    fn config_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[env]\nKITT_CFG_TEST_MISSING = \"filled\"\n",
        )
        .unwrap();
        env::remove_var("KITT_CFG_TEST_MISSING");
        load_and_apply(Some(dir.path())).unwrap();
        assert_eq!(env::var("KITT_CFG_TEST_MISSING").as_deref(), Ok("filled"));
        env::remove_var("KITT_CFG_TEST_MISSING");
    }

    #[test]
    fn load_and_apply_no_config_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_and_apply(Some(dir.path())).is_ok());
    }
}
