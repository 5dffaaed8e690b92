// Implementation of the PostgreSQL client role: the proxy pretends to be a
// regular client when it talks to the real backend.

// Standard library imports
use std::time::{Duration, Instant};

// External crate imports
use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, BufStream};
use tokio::net::TcpStream;

// Internal crate imports
use crate::auth::scram_client::ScramSha256;
use crate::errors::{Error, ServerIdentifier};
use crate::messages::constants::*;
use crate::messages::{
    md5_hash_password, read_message, simple_query, startup, write_all_flush, PgErrorMsg,
};
use crate::utils::quote_identifier;

use super::stream::create_tcp_stream;

/// Dial timeout for the temporary authentication connection.
pub const AUTH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live, authenticated connection to the backend.
#[derive(Debug)]
pub struct Server {
    identifier: ServerIdentifier,

    host: String,
    port: u16,

    stream: BufStream<TcpStream>,

    /// Backend id and secret key used for query cancellation.
    process_id: i32,
    secret_key: i32,

    /// ParameterStatus values the backend sent during startup.
    server_parameters: Vec<(String, String)>,

    /// Is the server inside a transaction or idle.
    in_transaction: bool,

    /// A SET ROLE was issued and not yet reset.
    role_assumed: bool,

    /// Is the server broken? The pool will discard it if so.
    bad: bool,

    connected_at: Instant,
    last_checkin: Instant,
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}]-{}@{}:{}/{}",
            self.process_id,
            self.identifier.username,
            self.host,
            self.port,
            self.identifier.database
        )
    }
}

impl Server {
    /// Pretend to be the Postgres client and connect to the backend with the
    /// given credentials. Performs the whole authentication handshake
    /// (cleartext, MD5 or SCRAM-SHA-256, whichever the backend demands) and
    /// returns the connection in a ready-for-query state.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        application_name: &str,
        connect_timeout: Duration,
    ) -> Result<Server, Error> {
        let mut stream = create_tcp_stream(host, port, connect_timeout).await?;

        let server_identifier = ServerIdentifier::new(username, database);

        // StartupMessage
        startup(&mut stream, username, database, application_name).await?;

        let mut process_id: i32 = 0;
        let mut secret_key: i32 = 0;
        let mut server_parameters: Vec<(String, String)> = Vec::new();
        let mut scram: Option<ScramSha256> = None;

        loop {
            let code = match stream.read_u8().await {
                Ok(code) => code as char,
                Err(err) => {
                    return Err(Error::ServerStartupError(
                        format!("message code ({err})"),
                        server_identifier,
                    ));
                }
            };

            let len = match stream.read_i32().await {
                Ok(len) => len,
                Err(err) => {
                    return Err(Error::ServerStartupError(
                        format!("message length ({err})"),
                        server_identifier,
                    ));
                }
            };
            if !(4..=MAX_STARTUP_PACKET_SIZE).contains(&len) {
                return Err(Error::ServerStartupError(
                    format!("message '{code}' with unreasonable length {len}"),
                    server_identifier,
                ));
            }

            match code {
                // Authentication
                'R' => {
                    let auth_code = match stream.read_i32().await {
                        Ok(auth_code) => auth_code,
                        Err(err) => {
                            return Err(Error::ServerStartupError(
                                format!("authentication code ({err})"),
                                server_identifier,
                            ));
                        }
                    };

                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),

                        AUTHENTICATION_CLEAR_PASSWORD => {
                            let mut response = BytesMut::with_capacity(password.len() + 6);
                            response.put_u8(b'p');
                            response.put_i32(4 + password.len() as i32 + 1);
                            response.put_slice(password.as_bytes());
                            response.put_u8(0);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        MD5_ENCRYPTED_PASSWORD => {
                            let mut salt = [0u8; 4];
                            if let Err(err) = stream.read_exact(&mut salt).await {
                                return Err(Error::ServerStartupError(
                                    format!("md5 salt ({err})"),
                                    server_identifier,
                                ));
                            }
                            let hash = md5_hash_password(username, password, &salt);
                            let mut response = BytesMut::with_capacity(hash.len() + 5);
                            response.put_u8(b'p');
                            response.put_i32(4 + hash.len() as i32);
                            response.put_slice(&hash);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL => {
                            let mut mechanisms = vec![0u8; (len - 8) as usize];
                            if let Err(err) = stream.read_exact(&mut mechanisms).await {
                                return Err(Error::ServerStartupError(
                                    format!("SASL mechanisms ({err})"),
                                    server_identifier,
                                ));
                            }
                            let mechanisms = String::from_utf8_lossy(&mechanisms);
                            if !mechanisms.contains(SCRAM_SHA_256) {
                                error!(
                                    "Backend offers no supported SASL mechanism: {mechanisms:?}"
                                );
                                return Err(Error::ServerAuthError(
                                    format!("unsupported SASL mechanisms {mechanisms:?}"),
                                    server_identifier,
                                ));
                            }

                            let mut conversation = ScramSha256::new(password);
                            let first = conversation.message();

                            // SASLInitialResponse
                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(
                                4 + SCRAM_SHA_256.len() as i32 + 1 + 4 + first.len() as i32,
                            );
                            response.put_slice(format!("{SCRAM_SHA_256}\0").as_bytes());
                            response.put_i32(first.len() as i32);
                            response.put(first);
                            write_all_flush(&mut stream, &response).await?;

                            scram = Some(conversation);
                        }

                        SASL_CONTINUE => {
                            let mut data = vec![0u8; (len - 8) as usize];
                            if let Err(err) = stream.read_exact(&mut data).await {
                                return Err(Error::ServerStartupError(
                                    format!("SASL continuation ({err})"),
                                    server_identifier,
                                ));
                            }

                            let conversation = match scram.as_mut() {
                                Some(conversation) => conversation,
                                None => {
                                    return Err(Error::ServerAuthError(
                                        "SASL continuation without an initial exchange".into(),
                                        server_identifier,
                                    ))
                                }
                            };
                            let proof = conversation.update(&data)?;

                            // SASLResponse
                            let mut response = BytesMut::new();
                            response.put_u8(b'p');
                            response.put_i32(4 + proof.len() as i32);
                            response.put(proof);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL_FINAL => {
                            let mut data = vec![0u8; (len - 8) as usize];
                            if let Err(err) = stream.read_exact(&mut data).await {
                                return Err(Error::ServerStartupError(
                                    format!("SASL final ({err})"),
                                    server_identifier,
                                ));
                            }

                            match scram.as_mut() {
                                Some(conversation) => conversation.finish(&data)?,
                                None => {
                                    return Err(Error::ServerAuthError(
                                        "SASL final without an initial exchange".into(),
                                        server_identifier,
                                    ))
                                }
                            }
                        }

                        _ => {
                            error!(
                                "Unsupported authentication demand from backend {}@{}: code {}",
                                server_identifier.username, server_identifier.database, auth_code
                            );
                            return Err(Error::ServerAuthError(
                                format!("unsupported authentication code {auth_code}"),
                                server_identifier,
                            ));
                        }
                    }
                }

                // ErrorResponse
                'E' => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    if let Err(err) = stream.read_exact(&mut body).await {
                        return Err(Error::ServerStartupError(
                            format!("error response ({err})"),
                            server_identifier,
                        ));
                    }

                    return match PgErrorMsg::parse(&body) {
                        Ok(fields) => {
                            warn!(
                                "Backend refused startup: {} {}: {}",
                                fields.severity, fields.code, fields.message
                            );
                            // Class 28 is invalid authorization; everything
                            // else reads as the backend being unusable.
                            if fields.code.starts_with("28") {
                                Err(Error::ServerAuthError(fields.message, server_identifier))
                            } else {
                                Err(Error::ServerStartupError(
                                    fields.message,
                                    server_identifier,
                                ))
                            }
                        }
                        Err(err) => Err(Error::ServerStartupError(
                            format!("unparsable error response ({err})"),
                            server_identifier,
                        )),
                    };
                }

                // NoticeResponse
                'N' => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    if let Err(err) = stream.read_exact(&mut body).await {
                        return Err(Error::ServerStartupError(
                            format!("notice ({err})"),
                            server_identifier,
                        ));
                    }
                    if let Ok(notice) = PgErrorMsg::parse(&body) {
                        debug!(
                            "Backend startup notice (severity: {} message: {})",
                            notice.severity, notice.message
                        );
                    }
                }

                // ParameterStatus
                'S' => {
                    let mut body = vec![0u8; (len - 4) as usize];
                    if let Err(err) = stream.read_exact(&mut body).await {
                        return Err(Error::ServerStartupError(
                            format!("parameter status ({err})"),
                            server_identifier,
                        ));
                    }
                    let mut parts = body.split(|b| *b == 0);
                    let key = parts.next().unwrap_or_default();
                    let value = parts.next().unwrap_or_default();
                    server_parameters.push((
                        String::from_utf8_lossy(key).to_string(),
                        String::from_utf8_lossy(value).to_string(),
                    ));
                }

                // BackendKeyData
                'K' => {
                    process_id = match stream.read_i32().await {
                        Ok(process_id) => process_id,
                        Err(err) => {
                            return Err(Error::ServerStartupError(
                                format!("process id ({err})"),
                                server_identifier,
                            ))
                        }
                    };
                    secret_key = match stream.read_i32().await {
                        Ok(secret_key) => secret_key,
                        Err(err) => {
                            return Err(Error::ServerStartupError(
                                format!("secret key ({err})"),
                                server_identifier,
                            ))
                        }
                    };
                }

                // ReadyForQuery
                'Z' => {
                    let mut status = vec![0u8; (len - 4) as usize];
                    if let Err(err) = stream.read_exact(&mut status).await {
                        return Err(Error::ServerStartupError(
                            format!("ready for query ({err})"),
                            server_identifier,
                        ));
                    }

                    let server = Server {
                        identifier: server_identifier,
                        host: host.to_string(),
                        port,
                        stream: BufStream::new(stream),
                        process_id,
                        secret_key,
                        server_parameters,
                        in_transaction: false,
                        role_assumed: false,
                        bad: false,
                        connected_at: Instant::now(),
                        last_checkin: Instant::now(),
                    };
                    info!("Backend connection established: {server}");
                    return Ok(server);
                }

                _ => {
                    return Err(Error::ProtocolSyncError(format!(
                        "Received unexpected message code '{code}' during server startup"
                    )));
                }
            }
        }
    }

    /// Authenticate against the backend on a throwaway connection, acting as
    /// a client with the given credentials. Only the outcome and the
    /// observed ParameterStatus values survive; the socket is closed.
    pub async fn authenticate_probe(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        application_name: &str,
    ) -> Result<Vec<(String, String)>, Error> {
        let server = Server::connect(
            host,
            port,
            username,
            password,
            database,
            application_name,
            AUTH_CONNECT_TIMEOUT,
        )
        .await?;
        Ok(server.server_parameters.clone())
    }

    #[inline(always)]
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    #[inline(always)]
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    pub fn server_parameters(&self) -> &[(String, String)] {
        &self.server_parameters
    }

    #[inline(always)]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Indicate that this server connection cannot be re-used and must be
    /// discarded.
    pub fn mark_bad(&mut self, reason: &str) {
        error!("Server {self} marked bad, reason: {reason}");
        self.bad = true;
    }

    #[inline(always)]
    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_checkin.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_checkin = Instant::now();
    }

    /// Whether the connection needs cleanup queries before it can be pooled
    /// again.
    pub fn needs_reset(&self) -> bool {
        self.role_assumed || self.in_transaction
    }

    /// Forward one client-originated frame to the backend.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        match write_all_flush(&mut self.stream, message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.bad = true;
                Err(err)
            }
        }
    }

    /// Read one framed backend message, tracking the transaction status
    /// carried by ReadyForQuery.
    pub async fn recv_message(&mut self) -> Result<BytesMut, Error> {
        match read_message(&mut self.stream, MAX_MESSAGE_SIZE).await {
            Ok(message) => {
                if message[0] == b'Z' && message.len() >= 6 {
                    self.in_transaction = message[5] != b'I';
                }
                Ok(message)
            }
            Err(err) => {
                self.bad = true;
                Err(err)
            }
        }
    }

    /// Execute a query via the simple protocol and drain the response.
    /// The result rows are discarded; an ErrorResponse fails the call.
    pub async fn small_simple_query(&mut self, query: &str) -> Result<(), Error> {
        let message = simple_query(query);
        self.send(&message).await?;

        let mut failure: Option<PgErrorMsg> = None;
        loop {
            let message = self.recv_message().await?;
            match message[0] {
                b'E' => {
                    failure = Some(PgErrorMsg::parse(&message[5..]).unwrap_or_else(|_| {
                        PgErrorMsg {
                            severity: "ERROR".into(),
                            code: "XX000".into(),
                            message: "unparsable error response".into(),
                        }
                    }));
                }
                b'Z' => break,
                _ => (),
            }
        }

        match failure {
            Some(fields) => Err(Error::ServerError(format!(
                "{} {}: {}",
                fields.severity, fields.code, fields.message
            ))),
            None => Ok(()),
        }
    }

    /// Round-trip health probe: an empty statement produces
    /// EmptyQueryResponse followed by ReadyForQuery.
    pub async fn ping(&mut self) -> Result<(), Error> {
        self.small_simple_query(";").await
    }

    /// Reparent session privileges to the given role. The name is quoted as
    /// an identifier, so arbitrary startup-supplied strings stay inert.
    pub async fn assume_role(&mut self, role: &str) -> Result<(), Error> {
        let query = format!("SET ROLE {}", quote_identifier(role));
        self.small_simple_query(&query).await?;
        self.role_assumed = true;
        Ok(())
    }

    /// Undo session state before the connection goes back to the pool.
    pub async fn checkin_reset(&mut self) -> Result<(), Error> {
        if self.in_transaction {
            warn!("Server {self} returned while still in transaction, rolling back");
            self.small_simple_query("ROLLBACK").await?;
        }
        if self.role_assumed {
            self.small_simple_query("RESET ROLE").await?;
            self.role_assumed = false;
        }
        Ok(())
    }
}

impl Drop for Server {
    /// Try to do a clean shut down. Best effort because the socket is in
    /// non-blocking mode, so it may not be ready for a write.
    fn drop(&mut self) {
        if !self.bad {
            let mut bytes = BytesMut::with_capacity(5);
            bytes.put_u8(b'X');
            bytes.put_i32(4);

            match self.stream.get_mut().try_write(&bytes) {
                Ok(5) => (),
                Err(err) => warn!("Dirty server {self} shutdown: {err}"),
                _ => warn!("Dirty server {self} shutdown"),
            };
        }

        info!("Server connection closed: {self}");
    }
}
