// Helper functions to frame, build and parse protocol messages.

// Declare submodules
pub mod constants;
pub mod error;
pub mod protocol;
pub mod socket;

// Re-export public items
pub use error::PgErrorMsg;
pub use protocol::{
    auth_ok, backend_key_data, error_message, error_response_terminal, md5_hash_password,
    md5_hash_second_pass, parse_params, parse_startup, plain_password_challenge, read_password,
    ready_for_query, server_parameter_message, simple_query, startup, vec_to_string,
};
pub use socket::{configure_tcp_socket, read_message, write_all, write_all_flush};

// Re-export protocol constants
pub use constants::*;
