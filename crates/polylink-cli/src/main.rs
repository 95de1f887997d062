//! Command-line entry point for the Polylink reference NodeServer.

mod demo;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use polylink_core::config::{self, defaults};
use polylink_core::{
    serve, Bootstrap, Controller, Interface, InterfaceConfig, NodeServer, PolyError,
    PollSettings, ReconnectPolicy, Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// Polylink - Polyglot v2 NodeServer over MQTT.
#[derive(Parser, Debug)]
#[command(name = "polylink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extra environment variable to read the profile number from.
    #[arg(long)]
    profile_var: Option<String>,

    /// MQTT broker host, overrides bootstrap and environment.
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port, overrides bootstrap and environment.
    #[arg(short, long)]
    port: Option<u16>,

    /// Reconnect attempts after a fault (0 = unlimited).
    #[arg(long, env = "POLYLINK_RECONNECT_ATTEMPTS", default_value_t = 1)]
    reconnect_attempts: u32,

    /// Delay before each reconnect attempt, in milliseconds.
    #[arg(long, default_value_t = 0)]
    reconnect_delay_ms: u64,

    /// Short poll period in seconds.
    #[arg(long, default_value_t = defaults::SHORT_POLL_SECS)]
    short_poll: u64,

    /// Long poll period in seconds.
    #[arg(long, default_value_t = defaults::LONG_POLL_SECS)]
    long_poll: u64,

    /// Do not wait for a bootstrap line on stdin.
    #[arg(long)]
    no_stdin: bool,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.verbose);

    config::load_default_env_file();

    let bootstrap = if args.no_stdin {
        None
    } else {
        read_bootstrap(Duration::from_millis(defaults::STDIN_WINDOW_MS)).await
    };

    let mut config = match InterfaceConfig::resolve(bootstrap, args.profile_var.as_deref()) {
        Ok(config) => config,
        Err(e @ PolyError::Identity(_)) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(host) = args.host {
        config.mqtt_host = host;
    }
    if let Some(port) = args.port {
        config.mqtt_port = port;
    }
    config.reconnect = ReconnectPolicy {
        max_attempts: (args.reconnect_attempts > 0).then_some(args.reconnect_attempts),
        delay_ms: args.reconnect_delay_ms,
    };
    config.polls = PollSettings {
        short_secs: args.short_poll,
        long_secs: args.long_poll,
    };
    tracing::info!(
        profile_num = %config.profile_num,
        broker = %config.broker_addr(),
        "Starting Polylink {}",
        polylink_core::VERSION
    );

    let polls = config.polls.clone();
    let interface = Interface::new(config)?;
    let controller = Controller::new(interface.clone(), demo::controller_node())?.with_polls(polls);
    let running = serve(&interface, NodeServer::new(controller, demo::DemoHooks::default()))?;

    let consumer = tokio::task::spawn_blocking(move || running.join());
    tokio::select! {
        joined = consumer => {
            let processed = joined??;
            tracing::info!(processed, "Dispatch consumer finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, disconnecting");
            interface.stop();
        }
    }
    Ok(())
}

/// Read the one-line JSON bootstrap from stdin, waiting at most `window`.
async fn read_bootstrap(window: Duration) -> Option<Bootstrap> {
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match tokio::time::timeout(window, stdin.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => match Bootstrap::parse(&line) {
            Ok(bootstrap) => {
                tracing::info!("Received bootstrap from STDIN");
                Some(bootstrap)
            }
            Err(e) => {
                tracing::debug!("Invalid bootstrap line on STDIN: {}", e);
                None
            }
        },
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            tracing::debug!("Failed to read STDIN: {}", e);
            None
        }
        Err(_) => {
            tracing::debug!("No bootstrap on STDIN, using environment");
            None
        }
    }
}

/// Console output plus a daily-rotated `logs/debug.log`.
fn init_logging(verbose: bool) -> WorkerGuard {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("POLYLINK_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("polylink={}", default_level))
            .add_directive(tracing::Level::WARN.into())
    });

    let file_appender = tracing_appender::rolling::daily("logs", "debug.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_names(true);

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    if json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .init();
    }
    guard
}
