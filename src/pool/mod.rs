// Process-wide pool management, one bounded pool per
// (service user, database) pair.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::config::Config;
use crate::errors::Error;

mod inner;

pub use inner::{Connector, Pool, PoolOptions, PooledConn};

/// An identifier for a connection pool.
#[derive(Hash, Debug, Clone, PartialEq, Eq)]
pub struct PoolIdentifier {
    /// The database clients want to connect to.
    pub db: String,

    /// The backend user the pool logs in as. Each user gets its own pool.
    pub user: String,
}

impl PoolIdentifier {
    pub fn new(db: &str, user: &str) -> PoolIdentifier {
        PoolIdentifier {
            db: db.to_string(),
            user: user.to_string(),
        }
    }
}

impl Display for PoolIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

/// Owns every pool in the process. Lookup takes the shared lock; pool
/// creation is double-checked under the exclusive lock so a thundering herd
/// of sessions builds each pool exactly once.
pub struct PoolManager {
    pools: RwLock<HashMap<PoolIdentifier, Pool>>,
    db_host: String,
    db_port: u16,
    options: PoolOptions,
    application_name: String,
}

impl PoolManager {
    pub fn new(db_host: &str, db_port: u16, options: PoolOptions) -> PoolManager {
        PoolManager {
            pools: RwLock::new(HashMap::new()),
            db_host: db_host.to_string(),
            db_port,
            options,
            application_name: "gprxy".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> PoolManager {
        PoolManager::new(&config.db_host, config.db_port, PoolOptions::default())
    }

    /// Acquire a pooled connection for the given backend identity, creating
    /// the pool lazily on first use.
    pub async fn acquire(
        &self,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<PooledConn, Error> {
        let identifier = PoolIdentifier::new(database, user);

        let existing = self.pools.read().get(&identifier).cloned();
        if let Some(pool) = existing {
            debug!("Pool {identifier} already exists");
            return pool.get().await;
        }

        let pool = {
            let mut pools = self.pools.write();
            // Double-checked: someone else may have created it while we
            // waited for the exclusive lock.
            pools
                .entry(identifier.clone())
                .or_insert_with(|| {
                    info!("Creating new pool {identifier}");
                    Pool::new(
                        Connector {
                            host: self.db_host.clone(),
                            port: self.db_port,
                            username: user.to_string(),
                            password: password.to_string(),
                            database: database.to_string(),
                            application_name: self.application_name.clone(),
                        },
                        self.options.clone(),
                    )
                })
                .clone()
        };

        pool.get().await
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    pub fn get_pool(&self, database: &str, user: &str) -> Option<Pool> {
        self.pools
            .read()
            .get(&PoolIdentifier::new(database, user))
            .cloned()
    }

    /// Background sweep dropping idle connections that outlived their
    /// budgets. Runs until the process exits.
    pub fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let cadence = manager.options.health_check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let pools: Vec<Pool> = manager.pools.read().values().cloned().collect();
                for pool in pools {
                    pool.prune_expired();
                }
            }
        })
    }
}
