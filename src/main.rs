use std::process;

use log::error;

use gprxy::app::{init_logging, parse, run_server, Commands};
use gprxy::config::{Config, VERSION};

fn main() {
    let args = parse();

    if let Some(Commands::Version) = args.command {
        println!("gprxy {VERSION}");
        return;
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            process::exit(exitcode::CONFIG);
        }
    };

    init_logging(&config);

    if let Err(err) = run_server(config) {
        error!("Fatal: {err}");
        process::exit(exitcode::UNAVAILABLE);
    }

    process::exit(exitcode::OK);
}
