// Per-connection dispatch: SSL negotiation, cancel routing, and handing
// regular startups to the session engine.

use std::pin::Pin;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};
use openssl::ssl::Ssl;
use tokio::io::split;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::app::server::ProxyContext;
use crate::errors::Error;
use crate::messages::{write_all, write_all_flush};
use crate::server::startup_cancel;

use super::core::Session;
use super::startup::{get_startup, ClientConnectionType};

/// Client entrypoint. Owns the connection from accept to teardown.
pub async fn client_entrypoint(mut stream: TcpStream, ctx: &ProxyContext) -> Result<(), Error> {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to get peer address: {err:?}"
            )));
        }
    };

    match get_startup::<TcpStream>(&mut stream).await? {
        // Client requested a TLS connection.
        (ClientConnectionType::Tls, _) => {
            if let Some(tls_acceptor) = &ctx.tls_acceptor {
                // TLS is configured; accept and re-enter the startup state
                // over the encrypted stream.
                let mut yes = BytesMut::new();
                yes.put_u8(b'S');
                write_all_flush(&mut stream, &yes).await?;

                let ssl = Ssl::new(tls_acceptor.context())
                    .map_err(|err| Error::TlsError(format!("can't prepare session: {err}")))?;
                let mut stream = SslStream::new(ssl, stream)
                    .map_err(|err| Error::TlsError(format!("can't wrap socket: {err}")))?;
                if let Err(err) = Pin::new(&mut stream).accept().await {
                    return Err(Error::TlsError(format!("TLS negotiation failed: {err:?}")));
                }

                match get_startup(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        info!("Client {addr:?} connected (TLS)");
                        let (read, write) = split(stream);
                        let mut session = Session::startup(read, write, addr, bytes, ctx).await?;
                        session.run().await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes, ctx).await,
                    (ClientConnectionType::Tls, _) => Err(Error::ProtocolSyncError(
                        "Bad postgres client (tls inside tls)".into(),
                    )),
                }
            } else {
                // TLS is not configured; decline and let the client continue
                // in cleartext on the same socket.
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all(&mut stream, no).await?;

                match get_startup::<TcpStream>(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        info!("Client {addr:?} connected (plain)");
                        let (read, write) = split(stream);
                        let mut session = Session::startup(read, write, addr, bytes, ctx).await?;
                        session.run().await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes, ctx).await,
                    (ClientConnectionType::Tls, _) => Err(Error::ProtocolSyncError(
                        "Bad postgres client (plain)".into(),
                    )),
                }
            }
        }

        // Plaintext startup.
        (ClientConnectionType::Startup, bytes) => {
            info!("Client {addr:?} connected (plain)");
            let (read, write) = split(stream);
            let mut session = Session::startup(read, write, addr, bytes, ctx).await?;
            session.run().await
        }

        // Out-of-band cancel: a short-lived session that never talks back.
        (ClientConnectionType::CancelQuery, bytes) => handle_cancel(bytes, ctx).await,
    }
}

/// Route a CancelRequest. The synthetic key the client holds is the backend
/// key of its pooled connection, so a registry hit is replayed verbatim on
/// a fresh backend connection. A miss is silently discarded, consistent
/// with PostgreSQL, which never answers cancels.
async fn handle_cancel(mut bytes: BytesMut, ctx: &ProxyContext) -> Result<(), Error> {
    let process_id = bytes.get_i32();
    let secret_key = bytes.get_i32();

    match ctx.registry.lookup(process_id, secret_key) {
        Some(entry) => {
            info!("Cancel request for backend [{}]", entry.process_id);
            startup_cancel::cancel(&entry.host, entry.port, entry.process_id, entry.secret_key)
                .await
        }
        None => {
            debug!("Cancel request for unknown key ({process_id}, {secret_key}), ignoring");
            Ok(())
        }
    }
}
