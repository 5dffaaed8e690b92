// PostgreSQL v3 wire protocol constants.

/// Protocol version 3.0.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

/// Magic codes a client may send in place of the protocol version.
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const REQUEST_GSSENCMODE_CODE: i32 = 80877104;

/// Authentication request codes carried in 'R' messages.
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

pub const MESSAGE_TERMINATOR: u8 = 0;

/// Startup-phase packets are tiny; anything bigger is a confused or hostile
/// client.
pub const MAX_STARTUP_PACKET_SIZE: i32 = 8 * 1024;

/// Upper bound for a single framed message during relay.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;
