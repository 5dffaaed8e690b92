//! Errors.

use std::fmt;

/// Various errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    SocketError(String),
    ProtocolSyncError(String),
    ClientBadStartup,
    ClientError(String),
    AuthError(String),
    Token(TokenError),
    NoServiceAccount(String),
    ScramClientError(String),
    ServerStartupError(String, ServerIdentifier),
    ServerAuthError(String, ServerIdentifier),
    ServerError(String),
    PoolError(String),
    PoolTimeout(String),
    MaxMessageSize,
    BadConfig(String),
    TlsError(String),
    ShuttingDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::SocketError(msg) => write!(f, "socket error: {msg}"),
            Error::ProtocolSyncError(msg) => write!(f, "protocol synchronization error: {msg}"),
            Error::ClientBadStartup => write!(f, "client sent a malformed startup message"),
            Error::ClientError(msg) => write!(f, "client error: {msg}"),
            Error::AuthError(msg) => write!(f, "authentication error: {msg}"),
            Error::Token(err) => write!(f, "token rejected: {err}"),
            Error::NoServiceAccount(msg) => write!(f, "{msg}"),
            Error::ScramClientError(msg) => write!(f, "SCRAM client error: {msg}"),
            Error::ServerStartupError(msg, id) => {
                write!(f, "error reading {msg} on server startup {id}")
            }
            Error::ServerAuthError(msg, id) => {
                write!(f, "server authentication error for {id}: {msg}")
            }
            Error::ServerError(msg) => write!(f, "server error: {msg}"),
            Error::PoolError(msg) => write!(f, "pool error: {msg}"),
            Error::PoolTimeout(msg) => write!(f, "pool timeout: {msg}"),
            Error::MaxMessageSize => write!(f, "message exceeds the maximum allowed size"),
            Error::BadConfig(msg) => write!(f, "configuration error: {msg}"),
            Error::TlsError(msg) => write!(f, "TLS error: {msg}"),
            Error::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        Error::Token(err)
    }
}

/// Reasons a bearer token can be rejected. These stay distinct for logging and
/// tests; at the session boundary they all collapse to a single
/// "Authentication failed" error response (SQLSTATE 28000).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed(String),
    Algorithm(String),
    MissingKeyId,
    UnknownKeyId(String),
    Signature(String),
    Expired,
    Issuer,
    Audience,
    MissingClaim(&'static str),
    JwksFetch(String),
    JwksDecode(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::Malformed(msg) => write!(f, "malformed token: {msg}"),
            TokenError::Algorithm(alg) => write!(f, "unsupported algorithm {alg:?}"),
            TokenError::MissingKeyId => write!(f, "token header carries no key id"),
            TokenError::UnknownKeyId(kid) => write!(f, "no JWKS entry for key id {kid:?}"),
            TokenError::Signature(msg) => write!(f, "signature verification failed: {msg}"),
            TokenError::Expired => write!(f, "token is expired"),
            TokenError::Issuer => write!(f, "issuer mismatch"),
            TokenError::Audience => write!(f, "audience mismatch"),
            TokenError::MissingClaim(claim) => write!(f, "missing claim {claim:?}"),
            TokenError::JwksFetch(msg) => write!(f, "JWKS fetch failed: {msg}"),
            TokenError::JwksDecode(msg) => write!(f, "JWKS decode failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(
        application_name: &str,
        username: &str,
        database: &str,
        addr: &str,
    ) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            addr,
            application_name,
            username,
            database,
        } = self;
        write!(
            f,
            "{{ {username}@{addr}/{database}?application_name={application_name} }}",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: &str, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username: username.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self { username, database } = self;
        write!(f, "{{ username: {username}, database: {database} }}")
    }
}
