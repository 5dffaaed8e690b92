pub mod oidc;
pub mod roles;
pub mod scram_client;

pub use oidc::{looks_like_token, OidcContext, TokenValidator};
pub use roles::RoleMapper;
pub use scram_client::ScramSha256;
