// TLS acceptor construction for the client-facing listener.

use std::path::Path;

use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslOptions, SslVersion};

use crate::errors::Error;

/// TLS 1.2 cipher policy: ECDHE key exchange with AES-GCM or
/// ChaCha20-Poly1305 only.
const TLS12_CIPHER_LIST: &str = "ECDHE+AESGCM:ECDHE+CHACHA20";

/// TLS 1.3 suites, ChaCha20-Poly1305 preferred.
const TLS13_CIPHER_SUITES: &str =
    "TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA256";

/// Key-exchange groups, in preference order.
const TLS_GROUPS: &str = "X25519:P-256:P-384";

/// Load the PEM certificate chain and private key and build the acceptor:
/// TLS 1.2 floor, server-side cipher preference, the restricted cipher
/// suites above, and the X25519 / P-256 / P-384 curves.
pub fn build_acceptor(certificate: &Path, private_key: &Path) -> Result<SslAcceptor, Error> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|err| Error::TlsError(format!("can't create acceptor: {err}")))?;

    builder.set_certificate_chain_file(certificate).map_err(|err| {
        Error::TlsError(format!(
            "can't load certificate {}: {err}",
            certificate.display()
        ))
    })?;
    builder
        .set_private_key_file(private_key, SslFiletype::PEM)
        .map_err(|err| {
            Error::TlsError(format!(
                "can't load private key {}: {err}",
                private_key.display()
            ))
        })?;
    builder
        .check_private_key()
        .map_err(|err| Error::TlsError(format!("certificate and key do not match: {err}")))?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|err| Error::TlsError(format!("can't pin protocol floor: {err}")))?;
    builder.set_options(SslOptions::CIPHER_SERVER_PREFERENCE);
    builder
        .set_cipher_list(TLS12_CIPHER_LIST)
        .map_err(|err| Error::TlsError(format!("can't restrict cipher list: {err}")))?;
    builder
        .set_ciphersuites(TLS13_CIPHER_SUITES)
        .map_err(|err| Error::TlsError(format!("can't restrict cipher suites: {err}")))?;
    builder
        .set_groups_list(TLS_GROUPS)
        .map_err(|err| Error::TlsError(format!("can't restrict key-exchange groups: {err}")))?;

    Ok(builder.build())
}
