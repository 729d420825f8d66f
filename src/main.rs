//! spotgate - telnet front end for a DX cluster console
//!
//! Each client logs in with a callsign and gets its own console program on a
//! pseudo-terminal. The console's screen-oriented output is rebuilt into
//! plain lines and real-time spots are rewritten into the fixed-column layout
//! logging software expects.
//!
//! # Modes
//!
//! | Mode | What runs |
//! |------|-----------|
//! | (default) | Telnet server proxying clients to the console program |
//! | `--bridge` | Activation-spot bridge posting feed spots to the cluster |
//!
//! # Quick Start
//!
//! ```text
//! spotgate                       # listen on 0.0.0.0:7300
//! spotgate -p 7373 --bind ::     # custom listener
//! spotgate --bridge              # run the spot bridge instead
//! spotgate -c /etc/spotgate.toml
//! ```

mod bridge;
mod config;
mod core;
mod server;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::server::Server;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Options {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    bridge: bool,
}

/// What the command line asks for
#[derive(Debug, PartialEq)]
enum Command {
    Run(Options),
    Help,
    Version,
}

fn print_version() {
    eprintln!("spotgate {}", VERSION);
}

fn print_help() {
    eprintln!("spotgate {} - telnet front end for a DX cluster console", VERSION);
    eprintln!();
    eprintln!("Usage: spotgate [OPTIONS]");
    eprintln!();
    eprintln!("Mode options:");
    eprintln!("  (default)             Telnet server");
    eprintln!("  --bridge              Activation-spot bridge");
    eprintln!();
    eprintln!("Server options:");
    eprintln!("  -p, --port <PORT>     Listen port (default 7300)");
    eprintln!("  --bind <ADDR>         Listen address (default 0.0.0.0)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -c, --config <PATH>   Configuration file");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.spotgate/config.toml");
    eprintln!();
    eprintln!("Bridge environment overrides:");
    eprintln!("  CALLSIGN, CHECK_INTERVAL, MIN_FREQ, MAX_FREQ, CLUSTER_HOST, CLUSTER_PORT");
    eprintln!();
    eprintln!("Log filter: RUST_LOG (default from log_level)");
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                let path = args.next().ok_or("Missing config path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            "-p" | "--port" => {
                let port = args.next().ok_or("Missing port")?;
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid port: {}", port))?;
                options.port = Some(port);
            }
            "--bind" => {
                options.bind = Some(args.next().ok_or("Missing bind address")?);
            }
            "--bridge" => {
                options.bridge = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
    }

    Ok(Command::Run(options))
}

/// File, then environment, then command line
fn load_config(options: &Options) -> anyhow::Result<Config> {
    let mut config = match &options.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    config.apply_env();

    if let Some(port) = options.port {
        config.server.port = port;
    }
    if let Some(bind) = &options.bind {
        config.server.bind = bind.clone();
    }
    Ok(config)
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder().with_env_filter(filter);

    match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let subscriber = builder
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args(env::args().skip(1)) {
        Ok(Command::Run(options)) => options,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            print_version();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = load_config(&options)?;
    init_logging(&config)?;
    info!("spotgate {} starting", VERSION);

    if options.bridge {
        Bridge::new(config.bridge).run();
        return Ok(());
    }

    Server::bind(config)?.run()
}
