use clap::{Parser, Subcommand};

/// gprxy: single-sign-on proxy for PostgreSQL.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server (the default when no subcommand is given).
    Start,
    /// Print the version and exit.
    Version,
}

pub fn parse() -> Args {
    Args::parse()
}
