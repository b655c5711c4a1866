use clap::Parser;
use keystone::{Config, Server};
use std::fs;
use std::path::PathBuf;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(about = "Scriptable HTTP/1.1 gateway")]
#[command(version)]
struct Cli {
    /// Route script executed by every worker at startup
    script: PathBuf,
}

fn main() {
    // RUST_LOG selects the level; workers log under their thread names,
    // so targets add nothing here.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.script) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot read {}: {}", cli.script.display(), e);
            process::exit(1);
        }
    };

    if let Err(e) = Server::new(Config::default()).serve(&source) {
        error!("server failed: {}", e);
        process::exit(1);
    }
}
