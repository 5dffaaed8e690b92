// Process wiring and the accept loop.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use socket2::SockRef;
use tokio::net::TcpSocket;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::runtime::Builder;

use crate::auth::{RoleMapper, TokenValidator};
use crate::config::Config;
use crate::errors::Error;
use crate::messages::configure_tcp_socket;
use crate::pool::PoolManager;
use crate::registry::CancelRegistry;
use crate::utils::human_duration;

use super::tls::init_tls;

/// The process-wide collaborators every session needs, owned here instead
/// of living in globals: the pool map, the cancel registry, the JWKS-backed
/// token validator and the role mapper. Sessions receive this by `Arc` and
/// keep only the handles they use.
pub struct ProxyContext {
    pub config: Config,
    pub pools: Arc<PoolManager>,
    pub registry: Arc<CancelRegistry>,
    pub tokens: Option<Arc<TokenValidator>>,
    pub roles: RoleMapper,
    pub tls_acceptor: Option<openssl::ssl::SslAcceptor>,
}

impl ProxyContext {
    pub fn new(config: Config) -> Result<ProxyContext, Error> {
        let tls_acceptor = init_tls(&config)?;

        let tokens = match &config.oidc {
            Some(settings) => Some(Arc::new(TokenValidator::new(settings.clone())?)),
            None => None,
        };

        let roles = RoleMapper::from_config(&config);
        let pools = Arc::new(PoolManager::from_config(&config));
        let registry = Arc::new(CancelRegistry::new());

        Ok(ProxyContext {
            config,
            pools,
            registry,
            tokens,
            roles,
            tls_acceptor,
        })
    }
}

/// The bound listening socket, ready to accept sessions.
pub struct Listener {
    listener: tokio::net::TcpListener,
    ctx: Arc<ProxyContext>,
}

impl Listener {
    pub async fn bind(ctx: Arc<ProxyContext>) -> Result<Listener, Error> {
        let addr = format!("{}:{}", ctx.config.host, ctx.config.port)
            .to_socket_addrs()
            .map_err(|err| Error::BadConfig(format!("can't resolve listen address: {err}")))?
            .next()
            .ok_or_else(|| Error::BadConfig("listen address resolves to nothing".into()))?;

        let listen_socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|err| Error::SocketError(format!("can't create listen socket: {err}")))?;

        listen_socket
            .set_reuseaddr(true)
            .map_err(|err| Error::SocketError(format!("can't set reuseaddr: {err}")))?;
        listen_socket
            .set_nodelay(true)
            .map_err(|err| Error::SocketError(format!("can't set nodelay: {err}")))?;
        {
            let sock_ref = SockRef::from(&listen_socket);
            if let Err(err) = sock_ref.set_linger(Some(Duration::from_secs(0))) {
                warn!("Could not configure tcp_so_linger for socket: {err:?}");
            }
        }

        listen_socket
            .bind(addr)
            .map_err(|err| Error::SocketError(format!("can't bind to {addr}: {err}")))?;
        let listener = listen_socket
            .listen(1024)
            .map_err(|err| Error::SocketError(format!("can't listen on {addr}: {err}")))?;

        Ok(Listener { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|err| Error::SocketError(format!("can't read local address: {err}")))
    }

    /// Accept loop. One task per connection; a per-connection failure is
    /// logged and never takes the listener down.
    pub async fn serve(self) -> Result<(), Error> {
        let maintenance = self.ctx.pools.clone().spawn_maintenance();
        let _guard = scopeguard::guard(maintenance, |handle| handle.abort());

        info!("Waiting for clients");
        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok((socket, addr)) => (socket, addr),
                Err(err) => {
                    error!("Accept error: {err:?}");
                    continue;
                }
            };

            configure_tcp_socket(&socket);

            let ctx = self.ctx.clone();
            tokio::task::spawn(async move {
                let start = Instant::now();

                match crate::client::client_entrypoint(socket, &ctx).await {
                    Ok(()) => {
                        info!(
                            "Client {:?} disconnected, session duration: {}",
                            addr,
                            human_duration(start.elapsed())
                        );
                    }
                    Err(err) => {
                        warn!(
                            "Client {:?} disconnected with error {:?}, duration: {}",
                            addr,
                            err,
                            human_duration(start.elapsed())
                        );
                    }
                };
            });
        }
    }
}

/// Build the runtime and run the proxy until a termination signal arrives.
pub fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        config.show();

        let ctx = Arc::new(ProxyContext::new(config)?);
        let listener = Listener::bind(ctx).await?;
        info!("Running on {}", listener.local_addr()?);

        #[cfg(unix)]
        {
            let mut term_signal = unix_signal(SignalKind::terminate())
                .map_err(|err| Error::SocketError(format!("can't install SIGTERM: {err}")))?;

            tokio::select! {
                result = listener.serve() => result?,
                _ = term_signal.recv() => {
                    info!("Got SIGTERM, shutting down");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Got SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = listener.serve() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Got interrupt, shutting down");
                }
            }
        }

        info!("Shutting down...");
        Ok::<(), Error>(())
    })?;

    Ok(())
}
