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
use std::sync::Arc;
use std::time::Duration;

use aasb_common::AppConfig;
use aasb_msg::{replay_journal, IpcTransport, MessageBroker, MessageDirection};
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use crate::wire::PayloadArgs;

/// Connection flags shared by the client commands.
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Broker socket; defaults to `transport.socket_path`.
    #[arg(long, value_name = "PATH", env = "AASB_SOCKET")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    #[arg(long)]
    topic: String,
    #[arg(long)]
    action: String,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
pub struct RequestArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    #[arg(long)]
    topic: String,
    #[arg(long)]
    action: String,
    #[command(flatten)]
    payload: PayloadArgs,
    /// Reply timeout; defaults to `broker.default_reply_timeout_ms`.
    #[arg(long = "timeout-ms", value_name = "MS")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Inbound,
    Outbound,
}

impl From<DirectionArg> for MessageDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Inbound => MessageDirection::Inbound,
            DirectionArg::Outbound => MessageDirection::Outbound,
        }
    }
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// Journal file to read.
    #[arg(long, value_name = "FILE")]
    journal: PathBuf,
    /// Which recorded direction to republish.
    #[arg(long, value_enum, default_value_t = DirectionArg::Outbound)]
    direction: DirectionArg,
    /// Pause before each envelope.
    #[arg(long = "delay-ms", value_name = "MS")]
    delay_ms: Option<u64>,
}

fn connect(args: &ConnectArgs, config: &AppConfig) -> Result<MessageBroker> {
    let socket: &Path = args
        .socket
        .as_deref()
        .unwrap_or(config.transport.socket_path.as_path());
    let transport = IpcTransport::connect(socket, config.transport.max_frame_bytes)
        .with_context(|| format!("failed to connect to broker socket {}", socket.display()))?;
    MessageBroker::builder(Arc::new(transport))
        .config(config.broker.clone())
        .build()
        .context("failed to attach broker to socket")
}

pub fn publish(args: PublishArgs, config: &AppConfig) -> Result<()> {
    let broker = connect(&args.connect, config)?;
    let message_id = broker
        .publish(args.topic, args.action, args.payload.load()?)
        .context("publish failed")?;
    println!("{message_id}");
    broker.shutdown();
    Ok(())
}

pub fn request(args: RequestArgs, config: &AppConfig) -> Result<()> {
    let broker = connect(&args.connect, config)?;
    let timeout = args.timeout_ms.map(Duration::from_millis);
    let outcome = broker.publish_and_await_reply(
        args.topic.as_str(),
        args.action.as_str(),
        args.payload.load()?,
        timeout,
    );
    broker.shutdown();
    let reply = outcome
        .with_context(|| format!("request {}/{} got no reply", args.topic, args.action))?;
    info!(message_id = %reply.message_id, "reply received");
    println!("{}", reply.payload);
    Ok(())
}

pub fn replay(args: ReplayArgs, config: &AppConfig) -> Result<()> {
    let broker = connect(&args.connect, config)?;
    let outcome = replay_journal(
        &args.journal,
        &broker,
        args.direction.into(),
        args.delay_ms.map(Duration::from_millis),
    );
    broker.shutdown();
    let count = outcome
        .with_context(|| format!("failed to replay journal {}", args.journal.display()))?;
    println!("{count}");
    Ok(())
}
