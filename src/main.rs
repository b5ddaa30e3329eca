//! GeoKV - An In-Memory Geospatial Database Server
//!
//! This is the main entry point for the GeoKV server binary. It parses the
//! command line, initializes logging, builds the controller (replaying the
//! append-only file), and serves connections until Ctrl+C.

use geokv::server::{Server, ServerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration from the command line.
struct Config {
    host: String,
    port: u16,
    dir: PathBuf,
    append_only: bool,
    protected_mode: Option<String>,
    dev: bool,
    http: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: geokv::DEFAULT_HOST.to_string(),
            port: geokv::DEFAULT_PORT,
            dir: PathBuf::from("data"),
            append_only: true,
            protected_mode: None,
            dev: false,
            http: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-h" | "--host" => {
                    config.host = take_value(&args, &mut i, "-h");
                }
                "-p" | "--port" => {
                    config.port = take_value(&args, &mut i, "-p").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                }
                "-d" | "--dir" => {
                    config.dir = PathBuf::from(take_value(&args, &mut i, "-d"));
                }
                "--appendonly" => {
                    match take_value(&args, &mut i, "--appendonly").as_str() {
                        "yes" => config.append_only = true,
                        "no" => config.append_only = false,
                        other => {
                            eprintln!("Error: --appendonly must be yes or no, got '{}'", other);
                            std::process::exit(1);
                        }
                    }
                }
                "--protected-mode" => {
                    let value = take_value(&args, &mut i, "--protected-mode");
                    if value != "yes" && value != "no" {
                        eprintln!("Error: --protected-mode must be yes or no");
                        std::process::exit(1);
                    }
                    config.protected_mode = Some(value);
                }
                "--dev" => {
                    config.dev = true;
                    i += 1;
                }
                "--http" => {
                    config.http = true;
                    i += 1;
                }
                "-v" | "--verbose" => {
                    config.verbose = true;
                    i += 1;
                }
                "--version" => {
                    println!("GeoKV version {}", geokv::VERSION);
                    std::process::exit(0);
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> String {
    if *i + 1 < args.len() {
        let value = args[*i + 1].clone();
        *i += 2;
        value
    } else {
        eprintln!("Error: {} requires a value", flag);
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        r#"
GeoKV - An In-Memory Geospatial Database Server

USAGE:
    geokv [OPTIONS]

OPTIONS:
    -h, --host <HOST>         Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>         Port to listen on (default: 9851)
    -d, --dir <DIR>           Data directory (default: data)
        --appendonly yes|no   Enable the append-only file (default: yes)
        --protected-mode yes|no
                              Refuse remote connections without a password
        --dev                 Enable developer commands
        --http                Log that the HTTP surface is expected
    -v, --verbose             Debug-level logging
        --version             Print version information
        --help                Print this help message

EXAMPLES:
    geokv                          # Start on 127.0.0.1:9851
    geokv -p 9852 -d /var/geokv    # Custom port and data directory

CONNECTING:
    Use redis-cli, curl, or any RESP client:
    $ redis-cli -p 9851
    127.0.0.1:9851> SET fleet truck1 POINT 33.5 -112.1
    OK
    127.0.0.1:9851> NEARBY fleet POINT 33.5 -112.1 1000
    $ curl http://127.0.0.1:9851/get/fleet/truck1/point
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!(version = geokv::VERSION, "GeoKV starting");

    let opts = ServerOptions {
        host: config.host.clone(),
        port: config.port,
        dir: config.dir.clone(),
        http: config.http,
        dev: config.dev,
        append_only: config.append_only,
        protected_mode_override: config.protected_mode.clone(),
    };
    let server = match Server::start(opts).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(addr = %config.bind_address(), "ready to accept connections");

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("shutdown signal received, stopping server");
    };

    tokio::select! {
        _ = Arc::clone(&server).serve(listener) => {}
        _ = shutdown => {}
    }

    server.stop();
    info!("server shutdown complete");
    Ok(())
}
