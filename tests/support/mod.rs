// Test support: a miniature PostgreSQL backend good enough to exercise the
// proxy end to end, plus a bare-bones client driver.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gprxy::messages::{
    backend_key_data, md5_hash_password, parse_params, read_message, ready_for_query,
    server_parameter_message, PgErrorMsg, MAX_MESSAGE_SIZE,
};

pub const MD5_SALT: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
pub const SCRAM_ITERATIONS: u32 = 4096;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Cleartext,
    Md5,
    Scram,
}

pub struct MockConfig {
    pub auth: AuthMode,
    /// The password every user of this backend is expected to present.
    pub password: String,
    pub fail_set_role: bool,
}

impl MockConfig {
    pub fn cleartext(password: &str) -> MockConfig {
        MockConfig {
            auth: AuthMode::Cleartext,
            password: password.to_string(),
            fail_set_role: false,
        }
    }

    pub fn md5(password: &str) -> MockConfig {
        MockConfig {
            auth: AuthMode::Md5,
            password: password.to_string(),
            fail_set_role: false,
        }
    }

    pub fn scram(password: &str) -> MockConfig {
        MockConfig {
            auth: AuthMode::Scram,
            password: password.to_string(),
            fail_set_role: false,
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub cancels: Mutex<Vec<(i32, i32)>>,
    pub queries: Mutex<Vec<(i32, String)>>,
    pub startup_users: Mutex<Vec<String>>,
    pub next_pid: AtomicI32,
    pub active: AtomicI32,
    pub max_active: AtomicI32,
}

pub struct MockBackend {
    pub addr: std::net::SocketAddr,
    pub state: Arc<MockState>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockBackend {
    pub async fn start(config: MockConfig) -> MockBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            next_pid: AtomicI32::new(100),
            ..MockState::default()
        });
        let config = Arc::new(config);

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let state = accept_state.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                    state.max_active.fetch_max(active, Ordering::SeqCst);
                    let _ = handle_connection(stream, &state, &config).await;
                    state.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        MockBackend {
            addr,
            state,
            handle,
        }
    }

    pub fn cancels(&self) -> Vec<(i32, i32)> {
        self.state.cancels.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<(i32, String)> {
        self.state.queries.lock().unwrap().clone()
    }

    pub fn startup_users(&self) -> Vec<String> {
        self.state.startup_users.lock().unwrap().clone()
    }

    /// Poll until some recorded query contains the needle.
    pub async fn wait_for_query(&self, needle: &str) -> bool {
        for _ in 0..500 {
            if self
                .queries()
                .iter()
                .any(|(_, query)| query.contains(needle))
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: &Arc<MockState>,
    config: &Arc<MockConfig>,
) -> std::io::Result<()> {
    let len = stream.read_i32().await?;
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await?;
    let mut bytes = BytesMut::from(&body[..]);
    let code = bytes.get_i32();

    // CancelRequest: record and hang up, like the real thing.
    if code == 80877102 {
        let pid = bytes.get_i32();
        let secret = bytes.get_i32();
        state.cancels.lock().unwrap().push((pid, secret));
        return Ok(());
    }

    if code != 196608 {
        return Ok(());
    }

    let params = parse_params(bytes).map_err(|_| std::io::Error::other("bad startup"))?;
    let user = params.get("user").cloned().unwrap_or_default();
    state.startup_users.lock().unwrap().push(user.clone());

    match config.auth {
        AuthMode::Cleartext => {
            if !authenticate_cleartext(&mut stream, &config.password).await? {
                return Ok(());
            }
        }
        AuthMode::Md5 => {
            if !authenticate_md5(&mut stream, &user, &config.password).await? {
                return Ok(());
            }
        }
        AuthMode::Scram => {
            if !authenticate_scram(&mut stream, &config.password).await? {
                return Ok(());
            }
        }
    }

    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst);
    let secret = pid + 1000;

    let mut completion = BytesMut::new();
    completion.put_u8(b'R');
    completion.put_i32(8);
    completion.put_i32(0);
    completion.put(server_parameter_message("server_version", "14.0"));
    completion.put(backend_key_data(pid, secret));
    completion.put(ready_for_query(false));
    stream.write_all(&completion).await?;

    // Extended-protocol responses pending until Sync.
    let mut pending = BytesMut::new();

    loop {
        let message = match read_message(&mut stream, MAX_MESSAGE_SIZE).await {
            Ok(message) => message,
            Err(_) => return Ok(()),
        };

        match message[0] {
            b'X' => return Ok(()),
            b'Q' => {
                let query = String::from_utf8_lossy(&message[5..message.len() - 1]).to_string();
                state.queries.lock().unwrap().push((pid, query.clone()));
                respond_to_query(&mut stream, state, config, pid, secret, &query).await?;
            }
            b'P' => pending.extend_from_slice(&[b'1', 0, 0, 0, 4]),
            b'B' => pending.extend_from_slice(&[b'2', 0, 0, 0, 4]),
            b'D' => pending.extend_from_slice(&[b'n', 0, 0, 0, 4]),
            b'E' => pending.put(command_complete("SELECT 0")),
            b'C' => pending.extend_from_slice(&[b'3', 0, 0, 0, 4]),
            b'S' => {
                let mut response = std::mem::take(&mut pending);
                response.put(ready_for_query(false));
                stream.write_all(&response).await?;
            }
            _ => (),
        }
    }
}

async fn respond_to_query(
    stream: &mut TcpStream,
    state: &Arc<MockState>,
    config: &Arc<MockConfig>,
    pid: i32,
    secret: i32,
    query: &str,
) -> std::io::Result<()> {
    let trimmed = query.trim();

    let mut response = BytesMut::new();
    if trimmed.starts_with("SET ROLE") {
        if config.fail_set_role {
            response.put(error_fields(
                "ERROR",
                "42501",
                "permission denied to set role",
            ));
        } else {
            response.put(command_complete("SET"));
        }
    } else if trimmed == "RESET ROLE" {
        response.put(command_complete("RESET"));
    } else if trimmed == "ROLLBACK" {
        response.put(command_complete("ROLLBACK"));
    } else if trimmed == "SELECT 1" {
        response.put(row_description(&["?column?"]));
        response.put(data_row(&["1"]));
        response.put(command_complete("SELECT 1"));
    } else if trimmed == "WAITCANCEL" {
        // Hold the "query" until a cancel for this very connection shows up.
        let mut cancelled = false;
        for _ in 0..500 {
            if state.cancels.lock().unwrap().contains(&(pid, secret)) {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if cancelled {
            response.put(error_fields(
                "ERROR",
                "57014",
                "canceling statement due to user request",
            ));
        } else {
            response.put(command_complete("SELECT 0"));
        }
    } else {
        // Includes the proxy's health probe ";".
        response.extend_from_slice(&[b'I', 0, 0, 0, 4]);
    }
    response.put(ready_for_query(false));
    stream.write_all(&response).await
}

async fn authenticate_cleartext(stream: &mut TcpStream, password: &str) -> std::io::Result<bool> {
    let mut challenge = BytesMut::new();
    challenge.put_u8(b'R');
    challenge.put_i32(8);
    challenge.put_i32(3);
    stream.write_all(&challenge).await?;

    let message = read_message(stream, MAX_MESSAGE_SIZE)
        .await
        .map_err(|_| std::io::Error::other("no password message"))?;
    if message[0] != b'p' {
        return Ok(false);
    }
    let mut presented = message[5..].to_vec();
    while presented.last() == Some(&0) {
        presented.pop();
    }

    if presented != password.as_bytes() {
        reject_auth(stream).await?;
        return Ok(false);
    }
    Ok(true)
}

async fn authenticate_md5(
    stream: &mut TcpStream,
    user: &str,
    password: &str,
) -> std::io::Result<bool> {
    let mut challenge = BytesMut::new();
    challenge.put_u8(b'R');
    challenge.put_i32(12);
    challenge.put_i32(5);
    challenge.put_slice(&MD5_SALT);
    stream.write_all(&challenge).await?;

    let message = read_message(stream, MAX_MESSAGE_SIZE)
        .await
        .map_err(|_| std::io::Error::other("no password message"))?;
    if message[0] != b'p' {
        return Ok(false);
    }

    let expected = md5_hash_password(user, password, &MD5_SALT);
    if &message[5..] != &expected[..] {
        reject_auth(stream).await?;
        return Ok(false);
    }
    Ok(true)
}

async fn authenticate_scram(stream: &mut TcpStream, password: &str) -> std::io::Result<bool> {
    // AuthenticationSASL advertising SCRAM-SHA-256.
    let mut challenge = BytesMut::new();
    challenge.put_u8(b'R');
    challenge.put_i32(23);
    challenge.put_i32(10);
    challenge.put_slice(b"SCRAM-SHA-256");
    challenge.put_u8(0);
    challenge.put_u8(0);
    stream.write_all(&challenge).await?;

    // SASLInitialResponse: mechanism name, i32 length, client-first.
    let message = read_message(stream, MAX_MESSAGE_SIZE)
        .await
        .map_err(|_| std::io::Error::other("no SASL initial response"))?;
    if message[0] != b'p' {
        return Ok(false);
    }
    let body = &message[5..];
    let nul = body.iter().position(|b| *b == 0).unwrap_or(0);
    let mechanism = String::from_utf8_lossy(&body[..nul]).to_string();
    if mechanism != "SCRAM-SHA-256" {
        return Ok(false);
    }
    let client_first = String::from_utf8_lossy(&body[nul + 5..]).to_string();
    let client_first_bare = match client_first.strip_prefix("n,,") {
        Some(bare) => bare.to_string(),
        None => return Ok(false),
    };
    let client_nonce = match client_first_bare.strip_prefix("n=,r=") {
        Some(nonce) => nonce.to_string(),
        None => return Ok(false),
    };

    let salt = b"mock-salt-0123456";
    let server_nonce = format!("{client_nonce}mockext");
    let server_first = format!(
        "r={server_nonce},s={},i={SCRAM_ITERATIONS}",
        BASE64_STANDARD.encode(salt)
    );

    let mut continue_msg = BytesMut::new();
    continue_msg.put_u8(b'R');
    continue_msg.put_i32(4 + 4 + server_first.len() as i32);
    continue_msg.put_i32(11);
    continue_msg.put_slice(server_first.as_bytes());
    stream.write_all(&continue_msg).await?;

    // SASLResponse: client-final.
    let message = read_message(stream, MAX_MESSAGE_SIZE)
        .await
        .map_err(|_| std::io::Error::other("no SASL response"))?;
    if message[0] != b'p' {
        return Ok(false);
    }
    let client_final = String::from_utf8_lossy(&message[5..]).to_string();
    let (without_proof, proof) = match client_final.rsplit_once(",p=") {
        Some(split) => split,
        None => return Ok(false),
    };

    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let salted = hi(password.as_bytes(), salt, SCRAM_ITERATIONS);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    let signature = hmac(&stored_key, auth_message.as_bytes());
    let expected: Vec<u8> = client_key
        .iter()
        .zip(signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();

    if BASE64_STANDARD.encode(&expected) != proof {
        reject_auth(stream).await?;
        return Ok(false);
    }

    let server_key = hmac(&salted, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());
    let server_final = format!("v={}", BASE64_STANDARD.encode(server_signature));

    let mut final_msg = BytesMut::new();
    final_msg.put_u8(b'R');
    final_msg.put_i32(4 + 4 + server_final.len() as i32);
    final_msg.put_i32(12);
    final_msg.put_slice(server_final.as_bytes());
    stream.write_all(&final_msg).await?;

    Ok(true)
}

async fn reject_auth(stream: &mut TcpStream) -> std::io::Result<()> {
    let response = error_fields("FATAL", "28P01", "password authentication failed");
    stream.write_all(&response).await
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(password).unwrap();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = prev;
    for _ in 1..iterations {
        let mut mac = Hmac::<Sha256>::new_from_slice(password).unwrap();
        mac.update(&prev);
        prev = mac.finalize().into_bytes().into();
        for (r, p) in result.iter_mut().zip(prev.iter()) {
            *r ^= p;
        }
    }
    result
}

pub fn command_complete(tag: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'C');
    bytes.put_i32(4 + tag.len() as i32 + 1);
    bytes.put_slice(tag.as_bytes());
    bytes.put_u8(0);
    bytes
}

pub fn error_fields(severity: &str, code: &str, message: &str) -> BytesMut {
    let mut fields = BytesMut::new();
    fields.put_u8(b'S');
    fields.put_slice(severity.as_bytes());
    fields.put_u8(0);
    fields.put_u8(b'C');
    fields.put_slice(code.as_bytes());
    fields.put_u8(0);
    fields.put_u8(b'M');
    fields.put_slice(message.as_bytes());
    fields.put_u8(0);
    fields.put_u8(0);

    let mut bytes = BytesMut::new();
    bytes.put_u8(b'E');
    bytes.put_i32(4 + fields.len() as i32);
    bytes.put(fields);
    bytes
}

pub fn row_description(columns: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for column in columns {
        body.put_slice(column.as_bytes());
        body.put_u8(0);
        body.put_i32(0);
        body.put_i16(0);
        body.put_i32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
    }
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'T');
    bytes.put_i32(4 + body.len() as i32);
    bytes.put(body);
    bytes
}

pub fn data_row(values: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
    }
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'D');
    bytes.put_i32(4 + body.len() as i32);
    bytes.put(body);
    bytes
}

// ---------------------------------------------------------------------------
// Client-side driver.

pub async fn send_startup<S>(stream: &mut S, user: &str, database: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut params = BytesMut::new();
    params.put_i32(196608);
    params.put_slice(b"user\0");
    params.put_slice(user.as_bytes());
    params.put_u8(0);
    params.put_slice(b"database\0");
    params.put_slice(database.as_bytes());
    params.put_u8(0);
    params.put_u8(0);

    let mut message = BytesMut::new();
    message.put_i32(4 + params.len() as i32);
    message.put(params);
    stream.write_all(&message).await
}

pub async fn send_password<S>(stream: &mut S, secret: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut message = BytesMut::new();
    message.put_u8(b'p');
    message.put_i32(4 + secret.len() as i32 + 1);
    message.put_slice(secret.as_bytes());
    message.put_u8(0);
    stream.write_all(&message).await
}

pub async fn send_query<S>(stream: &mut S, sql: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut message = BytesMut::new();
    message.put_u8(b'Q');
    message.put_i32(4 + sql.len() as i32 + 1);
    message.put_slice(sql.as_bytes());
    message.put_u8(0);
    stream.write_all(&message).await
}

pub async fn send_terminate<S>(stream: &mut S) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(&[b'X', 0, 0, 0, 4]).await
}

/// What the proxy sent back after the password: either the full synthetic
/// completion, or an error.
#[derive(Debug)]
pub struct Handshake {
    pub parameters: Vec<(String, String)>,
    pub key: (i32, i32),
    /// Message codes in arrival order, for transparency assertions.
    pub codes: Vec<u8>,
}

/// Drive the password exchange and read the completion sequence.
pub async fn authenticate<S>(stream: &mut S, secret: &str) -> Result<Handshake, PgErrorMsg>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    // AuthenticationCleartextPassword
    let challenge = read_message(stream, MAX_MESSAGE_SIZE).await.unwrap();
    assert_eq!(challenge[0], b'R', "expected an authentication request");
    let code = i32::from_be_bytes(challenge[5..9].try_into().unwrap());
    assert_eq!(code, 3, "expected cleartext");

    send_password(stream, secret).await.unwrap();

    let mut parameters = Vec::new();
    let mut key = (0, 0);
    let mut codes = Vec::new();

    loop {
        let message = read_message(stream, MAX_MESSAGE_SIZE).await.unwrap();
        codes.push(message[0]);
        match message[0] {
            b'E' => {
                return Err(PgErrorMsg::parse(&message[5..]).unwrap());
            }
            b'S' => {
                let body = &message[5..];
                let mut parts = body.split(|b| *b == 0);
                let k = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
                let v = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
                parameters.push((k, v));
            }
            b'K' => {
                let mut body = &message[5..];
                key = (body.get_i32(), body.get_i32());
            }
            b'Z' => {
                assert_eq!(message[5], b'I');
                return Ok(Handshake {
                    parameters,
                    key,
                    codes,
                });
            }
            b'R' => {
                let code = i32::from_be_bytes(message[5..9].try_into().unwrap());
                assert_eq!(code, 0, "expected AuthenticationOk");
            }
            other => panic!("unexpected message '{}' during handshake", other as char),
        }
    }
}

/// Read forwarded messages until ReadyForQuery, returning the full frames.
pub async fn read_until_ready<S>(stream: &mut S) -> Vec<BytesMut>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut messages = Vec::new();
    loop {
        let message = read_message(stream, MAX_MESSAGE_SIZE).await.unwrap();
        let done = message[0] == b'Z';
        messages.push(message);
        if done {
            return messages;
        }
    }
}

/// Fire a CancelRequest over its own connection, as a real client would.
pub async fn send_cancel(addr: std::net::SocketAddr, pid: i32, secret: i32) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut message = BytesMut::new();
    message.put_i32(16);
    message.put_i32(80877102);
    message.put_i32(pid);
    message.put_i32(secret);
    stream.write_all(&message).await.unwrap();
    stream
}

/// Send an SSLRequest and return the proxy's single-byte answer.
pub async fn ssl_request(stream: &mut TcpStream) -> u8 {
    let mut message = BytesMut::new();
    message.put_i32(8);
    message.put_i32(80877103);
    stream.write_all(&message).await.unwrap();
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await.unwrap();
    answer[0]
}
