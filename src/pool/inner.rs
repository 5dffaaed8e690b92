// A bounded pool of backend connections for one (service user, database)
// pair. Capacity is enforced with a semaphore; checked-in connections are
// kept LIFO so a warm connection is handed out first.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::errors::Error;
use crate::server::Server;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Hard ceiling on live connections, idle and checked out combined.
    pub max_size: usize,
    pub connect_timeout: Duration,
    /// How long an acquisition may wait for a free slot.
    pub wait_timeout: Duration,
    pub max_lifetime: Duration,
    pub max_idle: Duration,
    /// Cadence of the background sweep over idle connections.
    pub health_check_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            max_size: 5,
            connect_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(60 * 60),
            max_idle: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Everything needed to open one more backend connection for this pool.
#[derive(Debug, Clone)]
pub struct Connector {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub application_name: String,
}

impl Connector {
    async fn create(&self, connect_timeout: Duration) -> Result<Server, Error> {
        Server::connect(
            &self.host,
            self.port,
            &self.username,
            &self.password,
            &self.database,
            &self.application_name,
            connect_timeout,
        )
        .await
    }
}

struct Slots {
    idle: VecDeque<Server>,
    /// Live connections, idle and checked out combined.
    total: usize,
}

pub(crate) struct PoolInner {
    connector: Connector,
    options: PoolOptions,
    slots: Mutex<Slots>,
    semaphore: Semaphore,
}

impl PoolInner {
    fn expired(&self, server: &Server) -> bool {
        server.age() > self.options.max_lifetime || server.idle_for() > self.options.max_idle
    }

    fn push_idle(&self, mut server: Server) {
        server.touch();
        self.slots.lock().idle.push_front(server);
        self.semaphore.add_permits(1);
    }

    fn discard(&self, server: Server) {
        self.slots.lock().total -= 1;
        self.semaphore.add_permits(1);
        drop(server);
    }

    /// Take a connection back from a finished session. Reset queries run on
    /// a spawned task so teardown never blocks; a connection that cannot be
    /// reset is discarded.
    fn checkin(self: Arc<Self>, server: Server) {
        if server.is_bad() {
            self.discard(server);
            return;
        }

        if server.needs_reset() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let inner = self.clone();
                    handle.spawn(async move {
                        let mut server = server;
                        match server.checkin_reset().await {
                            Ok(()) => inner.push_idle(server),
                            Err(err) => {
                                warn!("Discarding connection that failed checkin reset: {err}");
                                inner.discard(server);
                            }
                        }
                    });
                }
                Err(_) => self.discard(server),
            }
            return;
        }

        self.push_idle(server);
    }
}

/// Cloneable handle to one bounded connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock();
        f.debug_struct("Pool")
            .field("user", &self.inner.connector.username)
            .field("database", &self.inner.connector.database)
            .field("idle", &slots.idle.len())
            .field("total", &slots.total)
            .finish()
    }
}

impl Pool {
    pub fn new(connector: Connector, options: PoolOptions) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                connector,
                slots: Mutex::new(Slots {
                    idle: VecDeque::with_capacity(options.max_size),
                    total: 0,
                }),
                semaphore: Semaphore::new(options.max_size),
                options,
            }),
        }
    }

    /// Number of live connections, idle and checked out combined.
    pub fn total(&self) -> usize {
        self.inner.slots.lock().total
    }

    /// Number of connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.slots.lock().idle.len()
    }

    /// Acquire a connection, waiting (bounded) when the pool is saturated.
    /// Recycled connections are health-probed before they are handed out; a
    /// probe failure surfaces as an error rather than a silent retry.
    pub async fn get(&self) -> Result<PooledConn, Error> {
        let permit = match timeout(
            self.inner.options.wait_timeout,
            self.inner.semaphore.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolError("pool is closed".into())),
            Err(_) => {
                return Err(Error::PoolTimeout(format!(
                    "timed out waiting for a connection to {}@{}",
                    self.inner.connector.username, self.inner.connector.database
                )))
            }
        };
        permit.forget();

        match self.get_inner().await {
            Ok(server) => Ok(PooledConn {
                server: Some(server),
                pool: Arc::downgrade(&self.inner),
            }),
            Err(err) => {
                self.inner.semaphore.add_permits(1);
                Err(err)
            }
        }
    }

    async fn get_inner(&self) -> Result<Server, Error> {
        loop {
            let candidate = { self.inner.slots.lock().idle.pop_front() };

            match candidate {
                Some(server) => {
                    if self.inner.expired(&server) {
                        info!("Dropping expired idle connection {server}");
                        self.inner.slots.lock().total -= 1;
                        drop(server);
                        continue;
                    }

                    let mut server = server;
                    match server.ping().await {
                        Ok(()) => return Ok(server),
                        Err(err) => {
                            warn!("Idle connection {server} failed health probe: {err}");
                            self.inner.slots.lock().total -= 1;
                            drop(server);
                            return Err(err);
                        }
                    }
                }
                None => {
                    {
                        self.inner.slots.lock().total += 1;
                    }
                    match self
                        .inner
                        .connector
                        .create(self.inner.options.connect_timeout)
                        .await
                    {
                        Ok(server) => return Ok(server),
                        Err(err) => {
                            self.inner.slots.lock().total -= 1;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Drop idle connections that outlived their lifetime or idle budget.
    /// Runs on the health-check cadence from the manager's sweeper task.
    pub fn prune_expired(&self) {
        let mut removed = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            let mut keep = VecDeque::with_capacity(slots.idle.len());
            while let Some(server) = slots.idle.pop_front() {
                if self.inner.expired(&server) {
                    slots.total -= 1;
                    removed.push(server);
                } else {
                    keep.push_back(server);
                }
            }
            slots.idle = keep;
        }
        for server in removed {
            info!("Pruning expired idle connection {server}");
            drop(server);
        }
    }
}

/// A checked-out backend connection. Returning it to the pool is the drop
/// handler's job, which makes release idempotent from the session's
/// perspective.
pub struct PooledConn {
    server: Option<Server>,
    pool: Weak<PoolInner>,
}

impl Deref for PooledConn {
    type Target = Server;
    fn deref(&self) -> &Self::Target {
        self.server.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.server.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.checkin(server);
            }
        }
    }
}

impl fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("server", &self.server)
            .finish()
    }
}
