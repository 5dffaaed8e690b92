// Framed reads and buffered writes over the raw sockets.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;

/// Read one typed protocol message: 1-byte tag, 4-byte inclusive length, body.
/// The returned buffer contains the full frame, ready to be forwarded
/// verbatim. A partial message never returns to the caller.
pub async fn read_message<S>(stream: &mut S, max_size: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read message code: {err}"
            )))
        }
    };

    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read message length: {err}"
            )))
        }
    };

    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "Message '{}' has invalid length {}",
            code as char, len
        )));
    }
    if len > max_size {
        return Err(Error::MaxMessageSize);
    }

    let mut message = BytesMut::with_capacity(len as usize + 1);
    message.put_u8(code);
    message.put_i32(len);
    message.resize(len as usize + 1, 0);

    match stream.read_exact(&mut message[5..]).await {
        Ok(_) => Ok(message),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to read message body: {err}"
        ))),
    }
}

/// Write the buffer out without flushing. Useful for single-byte SSL answers
/// on unbuffered sockets.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(&buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write to socket: {err}"
        ))),
    }
}

/// Write the buffer and flush. One call per logical send.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Failed to flush socket: {err}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Failed to write to socket: {err}"
        ))),
    }
}

/// TCP tuning applied to every socket we own, client- and backend-facing.
pub fn configure_tcp_socket(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        log::warn!("Can't set nodelay: {err:?}");
    }
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        log::warn!("Can't set tcp keepalive: {err:?}");
    }
}
