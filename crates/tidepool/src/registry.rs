//! Pool registry — one lazily built [`PoolEngine`] per profile name.
//!
//! Each profile gets a `tokio::sync::OnceCell`. Concurrent first lookups of
//! the same name all wait on that cell, so exactly one engine is built. A
//! failed build leaves the cell empty and the next lookup tries again.
//! Pools are never removed or replaced once built.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tidepool_core::PoolFile;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info};

use crate::engine::PoolEngine;
use crate::error::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;

static GLOBAL: OnceLock<PoolRegistry> = OnceLock::new();

/// Maps profile names to pools and driver names to connection factories.
pub struct PoolRegistry {
    pool_file: PoolFile,
    drivers: RwLock<HashMap<String, Arc<dyn ConnectionFactory>>>,
    pools: Mutex<HashMap<String, Arc<OnceCell<Arc<PoolEngine>>>>>,
}

impl PoolRegistry {
    pub fn new(pool_file: PoolFile) -> Self {
        Self {
            pool_file,
            drivers: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: register a driver before the registry is shared.
    pub fn with_driver(mut self, name: &str, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.drivers.get_mut().insert(name.to_string(), factory);
        self
    }

    /// Register (or replace) the factory used for profiles naming `name` as
    /// their driver. Pools already built keep their factory.
    pub async fn register_driver(&self, name: &str, factory: Arc<dyn ConnectionFactory>) {
        self.drivers.write().await.insert(name.to_string(), factory);
        debug!(driver = %name, "registered connection driver");
    }

    /// Install `registry` as the process-wide instance, reachable through
    /// [`global`](Self::global).
    ///
    /// The first install wins; later calls get their registry back.
    pub fn install(registry: PoolRegistry) -> Result<(), PoolRegistry> {
        GLOBAL.set(registry)?;
        info!("process-wide pool registry installed");
        Ok(())
    }

    /// The process-wide registry, if one has been installed.
    pub fn global() -> Option<&'static PoolRegistry> {
        GLOBAL.get()
    }

    /// Get the pool for `name`, building it on first use.
    pub async fn get_pool(&self, name: &str) -> PoolResult<Arc<PoolEngine>> {
        let cell = {
            let mut pools = self.pools.lock().await;
            Arc::clone(pools.entry(name.to_string()).or_default())
        };
        let pool = cell.get_or_try_init(|| self.build_pool(name)).await?;
        Ok(Arc::clone(pool))
    }

    async fn build_pool(&self, name: &str) -> PoolResult<Arc<PoolEngine>> {
        let settings = self
            .pool_file
            .settings_for(name)
            .map_err(|e| PoolError::PoolInitialization {
                profile: name.to_string(),
                reason: e.to_string(),
            })?;

        let factory = self
            .drivers
            .read()
            .await
            .get(&settings.driver)
            .cloned()
            .ok_or_else(|| PoolError::PoolInitialization {
                profile: name.to_string(),
                reason: format!("no driver registered as '{}'", settings.driver),
            })?;

        let pool = PoolEngine::start(name, settings, factory)?;
        info!(profile = %name, "pool registered");
        Ok(pool)
    }

    /// Names of pools that have been built, sorted.
    pub async fn pool_names(&self) -> Vec<String> {
        let pools = self.pools.lock().await;
        let mut names: Vec<String> = pools
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Shut down every built pool. Returns the number of connections closed.
    pub async fn shutdown_all(&self) -> usize {
        let built: Vec<Arc<PoolEngine>> = {
            let pools = self.pools.lock().await;
            pools.values().filter_map(|cell| cell.get().cloned()).collect()
        };

        let mut closed = 0;
        for pool in built {
            closed += pool.shutdown().await;
        }
        info!(closed, "all pools shut down");
        closed
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("profiles", &self.pool_file.profile_names())
            .finish_non_exhaustive()
    }
}
