//! Typed view of the `KITT_*` environment.

use std::path::PathBuf;

use crate::home::{default_db_path, kitt_home};
use crate::LoadError;

/// TLS material paths, all three optional independently.
#[derive(Clone, Debug, Default)]
pub struct TlsPaths {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/// Controller/agent process environment after [`crate::load_and_apply`].
#[derive(Clone, Debug)]
pub struct KittEnv {
    /// State root (`KITT_HOME`, default `~/.kitt`).
    pub home: PathBuf,
    /// Server-database DSN (`KITT_DB_DSN`); when unset the embedded file
    /// database at `<home>/kitt.db` is used.
    pub db_dsn: Option<String>,
    /// Embedded database path used when `db_dsn` is unset.
    pub db_path: PathBuf,
    /// Admin bearer token (`KITT_AUTH_TOKEN`) protecting write endpoints.
    pub auth_token: Option<String>,
    pub tls: TlsPaths,
    /// Model cache root (`KITT_MODEL_DIR`, default `<home>/models`).
    pub model_dir: PathBuf,
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl KittEnv {
    pub fn from_env() -> Result<Self, LoadError> {
        let home = kitt_home()?;
        let db_path = default_db_path()?;
        Ok(Self {
            db_dsn: non_empty("KITT_DB_DSN"),
            db_path,
            auth_token: non_empty("KITT_AUTH_TOKEN"),
            tls: TlsPaths {
                cert: non_empty("KITT_TLS_CERT").map(PathBuf::from),
                key: non_empty("KITT_TLS_KEY").map(PathBuf::from),
                ca: non_empty("KITT_TLS_CA").map(PathBuf::from),
            },
            model_dir: non_empty("KITT_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("models")),
            home,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn from_env_defaults() {
        let _env = crate::test_env_lock();
        let dir = tempfile::tempdir().unwrap();
        let prev_home = env::var("KITT_HOME").ok();
        let prev_dsn = env::var("KITT_DB_DSN").ok();
        env::set_var("KITT_HOME", dir.path());
        env::remove_var("KITT_DB_DSN");
        let e = KittEnv::from_env().unwrap();
        match prev_home {
            Some(p) => env::set_var("KITT_HOME", p),
            None => env::remove_var("KITT_HOME"),
        }
        if let Some(p) = prev_dsn {
            env::set_var("KITT_DB_DSN", p);
        }
        assert_eq!(e.home, dir.path());
        assert_eq!(e.db_path, dir.path().join("kitt.db"));
        assert_eq!(e.model_dir, dir.path().join("models"));
        assert!(e.db_dsn.is_none());
    }
}
