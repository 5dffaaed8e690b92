// Backend TCP dialing. The backend is reached over plaintext TCP; TLS to
// the backend is out of scope.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::Error;
use crate::messages::configure_tcp_socket;

pub(crate) async fn create_tcp_stream(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, Error> {
    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            log::error!("Could not connect to server {host}:{port}: {err}");
            return Err(Error::SocketError(format!(
                "Could not connect to server {host}:{port}: {err}"
            )));
        }
        Err(_) => {
            log::error!("Timed out connecting to server {host}:{port}");
            return Err(Error::SocketError(format!(
                "Timed out connecting to server {host}:{port}"
            )));
        }
    };

    configure_tcp_socket(&stream);

    Ok(stream)
}
