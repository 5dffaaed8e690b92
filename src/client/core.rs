// Handle clients by pretending to be a PostgreSQL server.

use std::sync::Arc;

use tokio::io::BufReader;

use crate::pool::PooledConn;
use crate::registry::CancelRegistry;

/// The per-connection session state. One of these is created per client
/// after a successful handshake; everything before that lives on the stack
/// of `Session::startup`.
pub struct Session<S, T> {
    /// The reads are buffered (8K by default).
    pub(crate) read: BufReader<S>,

    /// Writes are flushed per logical send, so no extra buffering here.
    pub(crate) write: T,

    pub(crate) addr: std::net::SocketAddr,

    /// The startup-supplied user; also the role the pooled session assumed.
    pub(crate) user: String,

    pub(crate) database: String,

    /// Who this session belongs to: the token's email on the bearer-token
    /// path, the startup user otherwise.
    pub(crate) identity: String,

    /// The synthetic cancel key shown to the client. It equals the pooled
    /// connection's own BackendKeyData.
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,

    /// The pooled backend connection. Dropping the session returns it to
    /// the pool exactly once.
    pub(crate) server: PooledConn,

    /// Handle to the cancel registry; the session deregisters itself on
    /// teardown.
    pub(crate) registry: Arc<CancelRegistry>,
}

impl<S, T> Drop for Session<S, T> {
    fn drop(&mut self) {
        // Unregister before the pooled connection goes back: the next
        // session to pick it up will register the same key.
        self.registry.unregister(self.process_id, self.secret_key);
    }
}
