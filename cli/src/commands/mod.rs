pub mod agents;
pub mod campaign;
pub mod engines;
pub mod results;
pub mod storage;
pub mod web;

use std::sync::Arc;

use anyhow::Context;

use kitt::store::sqlite::SqliteStore;
use kitt::store::Store;

/// Opens the configured store: `KITT_DB_DSN` selects the server driver
/// (behind the `postgres` feature), otherwise the embedded file database.
pub fn open_store() -> anyhow::Result<Arc<dyn Store>> {
    let env = config::KittEnv::from_env().context("read environment")?;
    if let Some(_dsn) = &env.db_dsn {
        #[cfg(feature = "postgres")]
        {
            let store = kitt::store::postgres::PostgresStore::connect(_dsn)
                .context("connect server database")?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        anyhow::bail!("KITT_DB_DSN is set but this build lacks the `postgres` feature");
    }
    let store = SqliteStore::open(&env.db_path)
        .with_context(|| format!("open {}", env.db_path.display()))?;
    Ok(Arc::new(store))
}
