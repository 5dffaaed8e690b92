use std::path::Path;

use log::{error, info};
use openssl::ssl::SslAcceptor;

use crate::config::Config;
use crate::errors::Error;
use crate::tls::build_acceptor;

/// Build the client-facing TLS acceptor if certificates are configured.
/// Absent certificates disable TLS: the proxy answers 'N' to SSLRequests
/// and continues in cleartext.
pub fn init_tls(config: &Config) -> Result<Option<SslAcceptor>, Error> {
    match (&config.tls_certificate, &config.tls_private_key) {
        (Some(certificate), Some(private_key)) => {
            let acceptor = build_acceptor(Path::new(certificate), Path::new(private_key))
                .map_err(|err| {
                    error!("Failed to build TLS acceptor: {err}");
                    err
                })?;
            info!("TLS enabled with certificate {certificate}");
            Ok(Some(acceptor))
        }
        _ => Ok(None),
    }
}
