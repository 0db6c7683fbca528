//! ---
//! aasb_section: "05-tooling"
//! aasb_subsection: "binary"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Operator CLI for the AASB broker."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use aasb_common::AppConfig;
use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

mod client;
mod serve;
mod wire;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/aasb.toml", "/etc/aasb/aasb.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "AASB broker operator utility",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Accept an engine connection on the broker socket")]
    Serve(serve::ServeArgs),
    #[command(about = "Publish one message to a serving broker")]
    Publish(client::PublishArgs),
    #[command(about = "Send a request and print the reply payload")]
    Request(client::RequestArgs),
    #[command(about = "Republish the envelopes recorded in a journal")]
    Replay(client::ReplayArgs),
    #[command(about = "Print the wire form of an envelope")]
    Encode(wire::EncodeArgs),
    #[command(about = "Validate a wire message and print its fields")]
    Decode(wire::DecodeArgs),
}

/// Configuration resolved for a command together with its provenance.
pub(crate) struct ResolvedConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
    pub load_time: Duration,
}

/// An explicit `--config` or `AASB_CONFIG` must load; otherwise the default
/// candidates are tried and built-in defaults apply when none exists.
fn resolve_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let started = Instant::now();
    let env_override = std::env::var(AppConfig::ENV_CONFIG_PATH)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from).collect(),
    };
    if explicit.is_none() && !env_override && !candidates.iter().any(|path| path.exists()) {
        return Ok(ResolvedConfig {
            config: AppConfig::default(),
            source: None,
            load_time: started.elapsed(),
        });
    }

    let loaded = AppConfig::load_with_source(&candidates)?;
    Ok(ResolvedConfig {
        config: loaded.config,
        source: Some(loaded.source),
        load_time: started.elapsed(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("aasbctl {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let Some(command) = cli.command else {
        anyhow::bail!("no command given; run with --help for usage");
    };

    match command {
        Commands::Encode(args) => wire::encode(args),
        Commands::Decode(args) => wire::decode(args),
        Commands::Serve(args) => serve::run(args, resolve_config(cli.config.as_deref())?),
        Commands::Publish(args) => {
            aasb_logging::init();
            client::publish(args, &resolve_config(cli.config.as_deref())?.config)
        }
        Commands::Request(args) => {
            aasb_logging::init();
            client::request(args, &resolve_config(cli.config.as_deref())?.config)
        }
        Commands::Replay(args) => {
            aasb_logging::init();
            client::replay(args, &resolve_config(cli.config.as_deref())?.config)
        }
    }
}
