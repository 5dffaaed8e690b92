use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::warn;

use crate::errors::Error;
use crate::messages::constants::CANCEL_REQUEST_CODE;
use crate::messages::write_all_flush;

use super::stream::create_tcp_stream;

const CANCEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Issue a query cancellation request to the backend. Uses a fresh
/// connection that is not part of the connection pool; the 16-byte packet is
/// the whole conversation and no reply is owed.
pub async fn cancel(host: &str, port: u16, process_id: i32, secret_key: i32) -> Result<(), Error> {
    let mut stream = create_tcp_stream(host, port, CANCEL_CONNECT_TIMEOUT).await?;

    warn!("Sending CancelRequest to [{process_id}] {host}:{port}");

    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);

    write_all_flush(&mut stream, &bytes).await
}
