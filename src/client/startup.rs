// The startup half of the session engine: reading the first wire-level
// message, the authentication pipeline, pool attachment and the synthetic
// completion sequence.

use bytes::{Buf, BufMut, BytesMut};
use log::{error, info, warn};
use tokio::io::{AsyncReadExt, BufReader};

use crate::app::server::ProxyContext;
use crate::auth::looks_like_token;
use crate::errors::{ClientIdentifier, Error};
use crate::messages::constants::*;
use crate::messages::{
    auth_ok, backend_key_data, error_response_terminal, parse_startup, plain_password_challenge,
    read_password, ready_for_query, server_parameter_message, vec_to_string, write_all,
    write_all_flush,
};
use crate::registry::CancelEntry;
use crate::server::Server;

use super::core::Session;

/// Type of connection received from client.
pub(crate) enum ClientConnectionType {
    Startup,
    Tls,
    CancelQuery,
}

/// Handle the first message the client sends. The first frame is untyped:
/// 4-byte length, 4-byte magic, then (for a startup) the parameter list.
pub(crate) async fn get_startup<S>(
    stream: &mut S,
) -> Result<(ClientConnectionType, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + tokio::io::AsyncWrite,
{
    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };

        // Reject absurd lengths outright to keep the pre-auth surface small.
        if !(8..=MAX_STARTUP_PACKET_SIZE).contains(&len) {
            return Err(Error::ClientBadStartup);
        }

        let mut startup = vec![0u8; (len - 4) as usize];
        match stream.read_exact(&mut startup).await {
            Ok(_) => (),
            Err(_) => return Err(Error::ClientBadStartup),
        };

        let mut bytes = BytesMut::from(&startup[..]);
        let code = bytes.get_i32();

        match code {
            // Client is requesting SSL (TLS).
            SSL_REQUEST_CODE => return Ok((ClientConnectionType::Tls, bytes)),

            // Regular startup over whatever transport we're on.
            PROTOCOL_VERSION_NUMBER => return Ok((ClientConnectionType::Startup, bytes)),

            // Client is requesting to cancel a running query.
            CANCEL_REQUEST_CODE => return Ok((ClientConnectionType::CancelQuery, bytes)),

            // GSSAPI encryption is not offered; decline and let the client
            // retry with SSL or plaintext on the same socket.
            REQUEST_GSSENCMODE_CODE => {
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all(stream, no).await?;
            }

            _ => {
                return Err(Error::ProtocolSyncError(format!(
                    "Unexpected startup code: {code}"
                )))
            }
        }
    }
}

impl<S, T> Session<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Run the handshake after the startup parameters arrived: obtain the
    /// client's secret, authenticate against the backend as a client,
    /// attach a pooled connection, and emit the synthetic completion
    /// sequence. Returns the session in the relaying state.
    pub async fn startup(
        mut read: S,
        mut write: T,
        addr: std::net::SocketAddr,
        bytes: BytesMut, // The rest of the startup message.
        ctx: &ProxyContext,
    ) -> Result<Session<S, T>, Error> {
        let parameters = parse_startup(bytes)?;

        // Mandatory by the protocol; parse_startup already enforced it.
        let user = match parameters.get("user") {
            Some(user) => user.clone(),
            None => return Err(Error::ClientBadStartup),
        };
        let database = parameters
            .get("database")
            .cloned()
            .unwrap_or_else(|| user.clone());
        let application_name = parameters
            .get("application_name")
            .cloned()
            .unwrap_or_else(|| "gprxy".to_string());

        let client_identifier =
            ClientIdentifier::new(&application_name, &user, &database, &addr.to_string());

        // The secret always arrives as a cleartext PasswordMessage; its
        // payload is either a bearer token or the real database password.
        plain_password_challenge(&mut write).await?;
        let secret = read_password(&mut read).await?;
        let secret = match vec_to_string(secret) {
            Ok(secret) => secret,
            Err(err) => {
                warn!("Unreadable secret from {client_identifier}: {err}");
                error_response_terminal(&mut write, "Authentication failed", "28000").await?;
                return Err(Error::AuthError(format!(
                    "secret from {client_identifier} is not valid UTF-8"
                )));
            }
        };
        if secret.is_empty() {
            error_response_terminal(&mut write, "Authentication failed", "28000").await?;
            return Err(Error::AuthError(format!(
                "empty secret from {client_identifier}"
            )));
        }

        let (backend_user, backend_password, identity) = if looks_like_token(&secret) {
            let validator = match &ctx.tokens {
                Some(validator) => validator,
                None => {
                    warn!("Bearer token from {client_identifier} but OIDC is not configured");
                    error_response_terminal(&mut write, "Authentication failed", "28000").await?;
                    return Err(Error::AuthError(
                        "bearer token presented but OIDC is not configured".into(),
                    ));
                }
            };

            let oidc = match validator.validate(&secret).await {
                Ok(oidc) => oidc,
                Err(err) => {
                    warn!("Token rejected for {client_identifier}: {err}");
                    error_response_terminal(&mut write, "Authentication failed", "28000").await?;
                    return Err(err.into());
                }
            };

            let account = match ctx.roles.map(&oidc.roles) {
                Ok(account) => account,
                Err(err) => {
                    warn!("No service account for {client_identifier}: {err}");
                    error_response_terminal(&mut write, "Authentication failed", "28000").await?;
                    return Err(err);
                }
            };

            info!(
                "Token login {} (roles {:?}) mapped to service account {}",
                oidc.email, oidc.roles, account.username
            );
            (
                account.username.clone(),
                account.password.clone(),
                oidc.email,
            )
        } else {
            // Native path: the client authenticates as itself; the proxy
            // replays the password to the backend in whatever form the
            // backend demands.
            (user.clone(), secret, user.clone())
        };

        // Prove the credentials against the backend on a throwaway
        // connection, collecting the ParameterStatus set along the way.
        let observed_parameters = match Server::authenticate_probe(
            &ctx.config.db_host,
            ctx.config.db_port,
            &backend_user,
            &backend_password,
            &database,
            &application_name,
        )
        .await
        {
            Ok(parameters) => parameters,
            Err(err @ Error::ServerAuthError(_, _)) => {
                warn!("Backend rejected credentials for {client_identifier}: {err}");
                error_response_terminal(&mut write, "Authentication failed", "28000").await?;
                return Err(err);
            }
            Err(err) => {
                error!("Backend unreachable for {client_identifier}: {err}");
                error_response_terminal(&mut write, "Backend Unavailable", "08006").await?;
                return Err(err);
            }
        };

        let mut server = match ctx
            .pools
            .acquire(&backend_user, &backend_password, &database)
            .await
        {
            Ok(server) => server,
            Err(err) => {
                error!("Pool acquisition failed for {client_identifier}: {err}");
                error_response_terminal(&mut write, "Database unavailable", "08006").await?;
                return Err(err);
            }
        };

        // Reparent the pooled session's privileges to the caller.
        if let Err(err) = server.assume_role(&user).await {
            error!("SET ROLE {user:?} failed for {client_identifier}: {err}");
            // Do not return a half-configured connection to the pool.
            server.mark_bad("failed to assume user role");
            error_response_terminal(&mut write, "failed to assume user role", "42501").await?;
            return Err(err);
        }

        let process_id = server.process_id();
        let secret_key = server.secret_key();

        // Synthetic completion: everything the client would have seen from
        // a direct backend handshake, except the key data is the POOLED
        // connection's, so cancels route to the right socket.
        let mut buf = BytesMut::new();
        buf.put(auth_ok());
        for (key, value) in &observed_parameters {
            buf.put(server_parameter_message(key, value));
        }
        buf.put(backend_key_data(process_id, secret_key));
        buf.put(ready_for_query(false));
        write_all_flush(&mut write, &buf).await?;

        ctx.registry.register(
            process_id,
            secret_key,
            CancelEntry {
                host: ctx.config.db_host.clone(),
                port: ctx.config.db_port,
                process_id,
                secret_key,
            },
        );

        info!("Client {client_identifier} attached to backend [{process_id}] as {backend_user}");

        Ok(Session {
            read: BufReader::new(read),
            write,
            addr,
            user,
            database,
            identity,
            process_id,
            secret_key,
            server,
            registry: ctx.registry.clone(),
        })
    }
}
