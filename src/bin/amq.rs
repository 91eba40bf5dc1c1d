//! AMQ core CLI binary.
//!
//! Inspection and simulation tooling for the broker session engine.
//!
//! # Commands
//!
//! - `config` - Print the effective configuration
//! - `encode` - Render a basic.deliver as wire frames
//! - `authorize` - Ask the configured access provider for a decision
//! - `simulate` - Run an in-process publish/deliver/ack session

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use amq::{
    access::{AccessControlGate, ObjectAttributes, Operation, Subject},
    broker::{Broker, DirectRouter, InMemoryQueue, QueueHandle},
    delivery::CreditLimit,
    framing::{FrameCodec, ProtocolVersion},
    message::{DeliveryProperties, Message},
    session::{ConsumeOptions, DeliveryOutcome},
    Config, VERSION,
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "amq")]
#[command(author = "AMQ Core Developers")]
#[command(version = VERSION)]
#[command(about = "AMQ Core - broker-side AMQP 0-8 session engine", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/amq/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Render a basic.deliver as wire frames
    Encode {
        /// Message body
        body: String,

        /// Exchange name
        #[arg(short, long, default_value = "")]
        exchange: String,

        /// Routing key
        #[arg(short, long, default_value = "")]
        routing_key: String,

        /// Consumer tag
        #[arg(long, default_value = "amq.ctag-cli")]
        consumer: String,

        /// Channel id
        #[arg(long, default_value = "1")]
        channel: u16,

        /// Delivery tag
        #[arg(long, default_value = "1")]
        tag: u64,

        /// Negotiated frame_max (0 = unlimited)
        #[arg(long)]
        frame_max: Option<u32>,

        /// Protocol version (0-8, 0-9-1)
        #[arg(short, long)]
        protocol: Option<String>,
    },

    /// Ask the access provider whether an operation is allowed
    Authorize {
        /// Operation (publish, consume, deliver, get, close-channel)
        operation: String,

        /// User name
        #[arg(short, long, default_value = "guest")]
        user: String,

        /// Object name (queue, exchange or channel)
        #[arg(short, long, default_value = "")]
        object: String,

        /// Virtual host
        #[arg(long, default_value = "/")]
        vhost: String,
    },

    /// Run an in-process session: publish, deliver, ack, close
    Simulate {
        /// Messages to publish
        #[arg(short, long, default_value = "10")]
        messages: usize,

        /// Consumer prefetch window (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        prefetch: u32,

        /// Leave every other delivery unacknowledged at close
        #[arg(long)]
        partial_ack: bool,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Config { json } => cmd_config(&config, json),

        Commands::Encode {
            body,
            exchange,
            routing_key,
            consumer,
            channel,
            tag,
            frame_max,
            protocol,
        } => cmd_encode(
            &config,
            &body,
            &exchange,
            &routing_key,
            &consumer,
            channel,
            tag,
            frame_max,
            protocol,
        ),

        Commands::Authorize {
            operation,
            user,
            object,
            vhost,
        } => cmd_authorize(&config, &operation, &user, &object, &vhost),

        Commands::Simulate {
            messages,
            prefetch,
            partial_ack,
            verbose,
        } => cmd_simulate(config, messages, prefetch, partial_ack, verbose),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load_default()?,
    };
    let config = file.merge(Config::from_env());
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn cmd_config(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_encode(
    config: &Config,
    body: &str,
    exchange: &str,
    routing_key: &str,
    consumer: &str,
    channel: u16,
    tag: u64,
    frame_max: Option<u32>,
    protocol: Option<String>,
) -> anyhow::Result<()> {
    let version = match protocol {
        Some(p) => ProtocolVersion::from_str(&p).map_err(|e| anyhow::anyhow!(e))?,
        None => config.broker.protocol,
    };
    let codec = FrameCodec::new(version, frame_max.unwrap_or(config.broker.frame_max));
    let message = Message::new(exchange, routing_key, body.to_string());

    let frames = codec.encode_deliver(&message, DeliveryProperties::default(), channel, tag, consumer)?;

    println!(
        "{} frames ({}, frame_max {})",
        frames.len(),
        version,
        codec.frame_max()
    );
    for frame in &frames {
        let encoded = frame.encode();
        let hex: String = encoded.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:?} ({} bytes): {}", frame.kind, encoded.len(), hex);
    }
    Ok(())
}

fn cmd_authorize(
    config: &Config,
    operation: &str,
    user: &str,
    object: &str,
    vhost: &str,
) -> anyhow::Result<()> {
    let operation = Operation::from_str(operation).map_err(|e| anyhow::anyhow!(e))?;
    let gate = AccessControlGate::from_config(&config.access)?;
    let subject = Subject::new(user).on_vhost(vhost);
    let object = ObjectAttributes::named(object).with("vhost", vhost);

    let decision = gate.authorize(operation, &subject, &object)?;
    println!("{operation} by '{user}' on '{}': {decision:?}", object.name);
    Ok(())
}

fn cmd_simulate(
    config: Config,
    messages: usize,
    prefetch: u32,
    partial_ack: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    init_logging(verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let router = Arc::new(DirectRouter::new());
        let queue = InMemoryQueue::shared("simulate");
        router.declare(queue.clone());

        let broker = Broker::new(config, router)?;
        let (conn, mut frames) = broker.connect(Subject::new("guest"));
        conn.open_channel(1).await?;

        let limit = if prefetch == 0 {
            CreditLimit::unlimited()
        } else {
            CreditLimit::count(prefetch)
        };
        let consumer = conn
            .consume(1, queue.clone(), "", ConsumeOptions::default().with_limit(limit))
            .await?;

        for i in 0..messages {
            conn.publish(Message::new("", "simulate", format!("message {i}")), 1)
                .await?;
        }

        let mut delivered = 0;
        let mut acked = 0;
        while let Some((message, props)) = queue.pop() {
            match conn.deliver_outcome(message.clone(), props, 1, &consumer).await? {
                DeliveryOutcome::Delivered { tag, .. } => {
                    delivered += 1;
                    if !partial_ack || tag % 2 == 0 {
                        conn.handle_ack(1, tag, false).await?;
                        acked += 1;
                    }
                },
                DeliveryOutcome::Blocked | DeliveryOutcome::Deferred => {
                    queue.requeue(message, props.redelivered);
                    break;
                },
            }
        }

        let stats = conn.stats().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);

        let summary = conn.close_channel(1, true).await?;
        conn.close().await;

        let mut blocks = 0;
        let mut bytes = 0;
        while let Ok(block) = frames.try_recv() {
            blocks += 1;
            bytes += block.encoded_len();
        }

        println!("Delivered:  {delivered}");
        println!("Acked:      {acked}");
        println!("Requeued:   {}", summary.requeued);
        println!("Queue depth {}", queue.depth());
        println!("Wire:       {blocks} blocks, {bytes} bytes");
        Ok::<_, anyhow::Error>(())
    })
}
