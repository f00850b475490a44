use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use nats_core_client::config::{load_options, load_options_from_env};
use nats_core_client::logging::{init_dual_logging, init_logging};
use nats_core_client::{Connection, Event, Options};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish, subscribe and request against a NATS server", long_about = None)]
struct Args {
    /// Server URLs, comma separated (overrides config file and NATS_URL)
    #[arg(short, long, env = "NATS_PROBE_SERVER")]
    server: Option<String>,

    /// Options file in TOML
    #[arg(short, long, env = "NATS_PROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, env = "NATS_PROBE_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a message and flush
    Pub {
        subject: String,
        #[arg(default_value = "")]
        data: String,
        /// Reply subject
        #[arg(short, long)]
        reply: Option<String>,
        /// Publish this many copies
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
    },
    /// Print messages until interrupted or `--max` are received
    Sub {
        subject: String,
        /// Queue group
        #[arg(short, long)]
        queue: Option<String>,
        /// Exit after this many messages
        #[arg(short, long)]
        max: Option<u64>,
    },
    /// Send a request and print the reply
    Request {
        subject: String,
        #[arg(default_value = "")]
        data: String,
        /// Milliseconds to wait for a reply
        #[arg(short, long, default_value = "2000")]
        timeout_ms: u64,
    },
}

fn options(args: &Args) -> Result<Options> {
    let mut opts = match &args.config {
        Some(path) => load_options(path)?,
        None => load_options_from_env()?,
    };
    if let Some(list) = &args.server {
        opts.servers = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if opts.name.is_none() {
        opts.name = Some("nats-probe".to_string());
    }
    Ok(opts.event_callback(|event| match event {
        Event::AsyncError(err) => warn!("Async error: {}", err),
        other => info!("Connection event: {:?}", other),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = match &args.log_file {
        Some(path) => init_dual_logging(path),
        None => {
            init_logging();
            None
        }
    };

    let opts = options(&args)?;
    let nc = Connection::connect(opts)
        .await
        .context("Failed to connect")?;
    info!("Connected to {}", nc.connected_url().unwrap_or_default());

    let outcome = run(&nc, args.command).await;
    nc.close().await;
    outcome
}

async fn run(nc: &Connection, command: Command) -> Result<()> {
    match command {
        Command::Pub {
            subject,
            data,
            reply,
            count,
        } => {
            let started = Instant::now();
            for _ in 0..count {
                match &reply {
                    Some(reply) => nc.publish_with_reply(&subject, reply, data.as_bytes())?,
                    None => nc.publish(&subject, data.as_bytes())?,
                }
            }
            nc.flush().await.context("Flush failed")?;
            println!(
                "Published {} message(s) to {} in {:?}",
                count,
                subject,
                started.elapsed()
            );
        }
        Command::Sub {
            subject,
            queue,
            max,
        } => {
            let sub = match &queue {
                Some(queue) => nc.queue_subscribe_sync(&subject, queue)?,
                None => nc.subscribe_sync(&subject)?,
            };
            if let Some(max) = max {
                sub.auto_unsubscribe(max)?;
            }
            nc.flush().await.context("Subscribe was not acknowledged")?;
            info!("Listening on {}", subject);

            let mut received = 0u64;
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Interrupted");
                        break;
                    }
                    msg = sub.recv() => {
                        let Ok(msg) = msg else { break };
                        received += 1;
                        println!(
                            "[#{}] {} {}: {}",
                            received,
                            msg.subject,
                            msg.reply.as_deref().unwrap_or("-"),
                            String::from_utf8_lossy(&msg.data)
                        );
                    }
                }
            }
            let (pending, _) = sub.pending();
            println!(
                "Received {} message(s), dropped {}, pending {}",
                received,
                sub.dropped(),
                pending
            );
        }
        Command::Request {
            subject,
            data,
            timeout_ms,
        } => {
            let reply = nc
                .request_timeout(&subject, data.as_bytes(), Duration::from_millis(timeout_ms))
                .await
                .with_context(|| format!("Request to {subject} failed"))?;
            println!("{}", String::from_utf8_lossy(&reply.data));
        }
    }
    Ok(())
}
