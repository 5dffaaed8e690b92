// Client side of SCRAM-SHA-256 (RFC 7677), used when the backend demands
// SASL authentication. The proxy terminates the conversation itself using
// the secret it holds, so nothing SASL-shaped ever reaches the real client.

use base64::prelude::*;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::Error;

const NONCE_LENGTH: usize = 24;

/// gs2 header for "no channel binding", and its base64 form sent in the
/// final message.
const GS2_HEADER: &str = "n,,";
const GS2_HEADER_ENCODED: &str = "biws";

enum State {
    Initial,
    FirstSent {
        client_first_bare: String,
    },
    FinalSent {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// A single SCRAM-SHA-256 client conversation.
pub struct ScramSha256 {
    password: String,
    nonce: String,
    state: State,
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        ScramSha256::with_nonce(password, nonce)
    }

    pub(crate) fn with_nonce(password: &str, nonce: String) -> ScramSha256 {
        ScramSha256 {
            password: password.to_string(),
            nonce,
            state: State::Initial,
        }
    }

    /// SASLInitialResponse payload (client-first message).
    pub fn message(&mut self) -> BytesMut {
        let client_first_bare = format!("n=,r={}", self.nonce);
        let message = format!("{GS2_HEADER}{client_first_bare}");
        self.state = State::FirstSent { client_first_bare };
        BytesMut::from(message.as_bytes())
    }

    /// Consume the server-first message, produce the client-final message.
    pub fn update(&mut self, server_first: &[u8]) -> Result<BytesMut, Error> {
        let client_first_bare = match std::mem::replace(&mut self.state, State::Done) {
            State::FirstSent { client_first_bare } => client_first_bare,
            _ => {
                return Err(Error::ScramClientError(
                    "server-first message arrived out of order".into(),
                ))
            }
        };

        let server_first = match std::str::from_utf8(server_first) {
            Ok(message) => message.to_string(),
            Err(err) => {
                return Err(Error::ScramClientError(format!(
                    "server-first message is not valid UTF-8: {err}"
                )))
            }
        };

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attribute in server_first.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => server_nonce = Some(value.to_string()),
                Some(("s", value)) => salt = Some(value.to_string()),
                Some(("i", value)) => iterations = Some(value.to_string()),
                _ => (),
            }
        }

        let server_nonce = server_nonce.ok_or_else(|| {
            Error::ScramClientError("server-first message carries no nonce".into())
        })?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(Error::ScramClientError(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = salt
            .ok_or_else(|| Error::ScramClientError("server-first message carries no salt".into()))?;
        let salt = BASE64_STANDARD
            .decode(salt)
            .map_err(|err| Error::ScramClientError(format!("salt is not valid base64: {err}")))?;

        let iterations: u32 = iterations
            .ok_or_else(|| {
                Error::ScramClientError("server-first message carries no iteration count".into())
            })?
            .parse()
            .map_err(|_| Error::ScramClientError("iteration count is not a number".into()))?;
        if iterations == 0 {
            return Err(Error::ScramClientError("iteration count is zero".into()));
        }

        let password = normalize(&self.password);
        let salted_password = hi(password.as_bytes(), &salt, iterations)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={GS2_HEADER_ENCODED},r={server_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, signature)| key ^ signature)
            .collect();

        let client_final = format!("{without_proof},p={}", BASE64_STANDARD.encode(&proof));

        self.state = State::FinalSent {
            salted_password,
            auth_message,
        };

        Ok(BytesMut::from(client_final.as_bytes()))
    }

    /// Verify the server-final message (the server's own signature).
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), Error> {
        let (salted_password, auth_message) = match std::mem::replace(&mut self.state, State::Done)
        {
            State::FinalSent {
                salted_password,
                auth_message,
            } => (salted_password, auth_message),
            _ => {
                return Err(Error::ScramClientError(
                    "server-final message arrived out of order".into(),
                ))
            }
        };

        let server_final = match std::str::from_utf8(server_final) {
            Ok(message) => message,
            Err(err) => {
                return Err(Error::ScramClientError(format!(
                    "server-final message is not valid UTF-8: {err}"
                )))
            }
        };

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::ScramClientError(format!(
                "server rejected authentication: {err}"
            )));
        }

        let verifier = server_final.strip_prefix("v=").ok_or_else(|| {
            Error::ScramClientError("server-final message carries no verifier".into())
        })?;
        let verifier = BASE64_STANDARD.decode(verifier).map_err(|err| {
            Error::ScramClientError(format!("verifier is not valid base64: {err}"))
        })?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if expected[..] != verifier[..] {
            return Err(Error::ScramClientError(
                "server signature does not match".into(),
            ));
        }

        Ok(())
    }
}

/// SASLprep the password; an unpreparable password is used as-is, matching
/// libpq.
fn normalize(password: &str) -> String {
    match stringprep::saslprep(password) {
        Ok(prepared) => prepared.into_owned(),
        Err(_) => password.to_string(),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], Error> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|err| Error::ScramClientError(format!("invalid HMAC key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Hi(), i.e. PBKDF2 with HMAC-SHA-256 as the PRF.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], Error> {
    let mut mac = Hmac::<Sha256>::new_from_slice(password)
        .map_err(|err| Error::ScramClientError(format!("invalid HMAC key: {err}")))?;
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());

    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = prev;

    for _ in 1..iterations {
        let mut mac = Hmac::<Sha256>::new_from_slice(password)
            .map_err(|err| Error::ScramClientError(format!("invalid HMAC key: {err}")))?;
        mac.update(&prev);
        prev = mac.finalize().into_bytes().into();
        for (result_byte, prev_byte) in result.iter_mut().zip(prev.iter()) {
            *result_byte ^= prev_byte;
        }
    }

    Ok(result)
}
