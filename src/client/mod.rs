mod core;
mod entrypoint;
mod relay;
mod startup;

pub use core::Session;
pub use entrypoint::client_entrypoint;
