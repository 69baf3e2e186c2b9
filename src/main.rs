//! Server entry point: parse flags, set up logging, run the event loop.

use rudis::server::{Config, Server};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn parse_args() -> Config {
    let mut config = Config::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                config.host = take_value(&args, i, "--host").to_string();
                i += 2;
            }
            "--port" | "-p" => {
                config.port = take_value(&args, i, "--port").parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid port number");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--threads" | "-t" => {
                let threads: usize = take_value(&args, i, "--threads").parse().unwrap_or(0);
                if threads == 0 {
                    eprintln!("error: --threads must be a positive integer");
                    std::process::exit(1);
                }
                config.threads = threads;
                i += 2;
            }
            "--version" | "-v" => {
                println!("rudis {}", rudis::VERSION);
                std::process::exit(0);
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
    }
    config
}

fn take_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v,
        None => {
            eprintln!("error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"rudis - in-memory multi-type key/value store

USAGE:
    rudis [OPTIONS]

OPTIONS:
    -h, --host <HOST>       Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>       Port to listen on (default: 1234)
    -t, --threads <N>       Disposal worker threads (default: 4)
    -v, --version           Print version information
        --help              Print this help message

Logging is controlled by RUST_LOG (e.g. RUST_LOG=rudis=debug)."#
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();
    let mut server = match Server::new(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run() {
        error!(error = %e, "event loop failed");
        std::process::exit(1);
    }
}
