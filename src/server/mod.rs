// The backend-facing half of the proxy: connecting to PostgreSQL as a
// client, and the out-of-band cancel dialer.

mod server_backend;
pub mod startup_cancel;
mod stream;

pub use server_backend::{Server, AUTH_CONNECT_TIMEOUT};
