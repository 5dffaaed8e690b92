// The relaying half of the session engine: one client request per turn,
// with the backend's response streamed through until ReadyForQuery.

use bytes::BytesMut;
use log::{debug, info};

use crate::errors::Error;
use crate::messages::constants::MAX_MESSAGE_SIZE;
use crate::messages::{read_message, write_all_flush, PgErrorMsg};

use super::core::Session;

/// Flush the response buffer once it grows past this.
const BUFFER_FLUSH_THRESHOLD: usize = 8192;

impl<S, T> Session<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Relay loop. Runs until the client terminates, either side fails, or
    /// a protocol violation turns up. Teardown (pool release, cancel-key
    /// deregistration) is the drop handler's job and runs on every exit
    /// path.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            let message = read_message(&mut self.read, MAX_MESSAGE_SIZE).await?;
            let code = message[0];

            debug!(
                "Client {}@{} [{}] sent '{}'",
                self.identity, self.database, self.addr, code as char
            );

            match code {
                // Terminate: the session ends, the pooled connection
                // survives and goes back to the pool.
                b'X' => {
                    info!(
                        "Client {} (role {}, database {}) disconnected",
                        self.identity, self.user, self.database
                    );
                    return Ok(());
                }

                // Messages that complete a client request. The backend will
                // answer with a stream terminated by ReadyForQuery (or hand
                // control back for COPY IN).
                b'Q' | b'S' | b'F' | b'c' | b'f' => {
                    self.server.send(&message).await?;
                    self.drain_response().await?;
                }

                // Extended-protocol messages and CopyData buffer on the
                // backend until a Sync (or CopyDone) arrives; draining here
                // would deadlock the batch.
                _ => {
                    self.server.send(&message).await?;
                }
            }
        }
    }

    /// Forward backend messages to the client until a ReadyForQuery is
    /// delivered. ErrorResponse and CommandComplete are observed but not
    /// terminal. A CopyInResponse returns control to the client-read stage
    /// so COPY FROM STDIN can stream.
    async fn drain_response(&mut self) -> Result<(), Error> {
        let mut buffer = BytesMut::with_capacity(BUFFER_FLUSH_THRESHOLD);

        loop {
            let message = self.server.recv_message().await?;
            let code = message[0];

            match code {
                // ReadyForQuery: the request is complete.
                b'Z' => {
                    buffer.extend_from_slice(&message);
                    write_all_flush(&mut self.write, &buffer).await?;
                    return Ok(());
                }

                // CopyInResponse / CopyBothResponse: the client speaks next.
                b'G' | b'W' => {
                    buffer.extend_from_slice(&message);
                    write_all_flush(&mut self.write, &buffer).await?;
                    return Ok(());
                }

                b'E' => {
                    if let Ok(fields) = PgErrorMsg::parse(&message[5..]) {
                        debug!(
                            "Backend error for {}@{}: {} {}: {}",
                            self.identity,
                            self.database,
                            fields.severity,
                            fields.code,
                            fields.message
                        );
                    }
                    buffer.extend_from_slice(&message);
                }

                b'C' => {
                    debug!(
                        "Command complete for {}@{}",
                        self.identity, self.database
                    );
                    buffer.extend_from_slice(&message);
                }

                _ => buffer.extend_from_slice(&message),
            }

            if buffer.len() >= BUFFER_FLUSH_THRESHOLD {
                write_all_flush(&mut self.write, &buffer).await?;
                buffer.clear();
            }
        }
    }
}
