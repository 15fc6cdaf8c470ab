use relay_worker::config::Config;
use relay_worker::control::{self, EventSink};
use relay_worker::logs;
use relay_worker::platform::telegram::TelegramFactory;
use relay_worker::worker::Worker;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long buffered events may take to reach the parent after shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(
    name = "relay-worker",
    version,
    about = "Chat-bot worker controlled over stdin/stdout"
)]
struct Cli {
    /// Path to the worker configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker on stdin/stdout (default)
    Run,
    /// Validate the configuration and print the effective values
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let code = runtime.block_on(async_main(cli))?;

    // The blocking stdin read cannot be cancelled; don't wait for it.
    runtime.shutdown_timeout(Duration::from_millis(100));
    std::process::exit(code);
}

async fn async_main(cli: Cli) -> anyhow::Result<i32> {
    // stdout is the control channel: diagnostics go to stderr, and
    // INFO+ records are also forwarded to the parent as `log` events.
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(logs::ControlLogLayer::new())
            .init();
    }

    let config = Config::load(cli.config.as_deref())
        .await
        .context("failed to load worker configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            print!("{}", config.to_yaml()?);
            Ok(0)
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<i32> {
    let (events, events_rx) = EventSink::channel();
    let (commands_tx, commands_rx) = tokio::sync::mpsc::channel(64);

    let shutdown = CancellationToken::new();

    let factory = Arc::new(TelegramFactory::new(&config));
    let worker = Worker::new(config, factory, commands_rx, events.clone(), shutdown.clone())
        .context("failed to initialise worker")?;

    let writer = control::spawn_writer(tokio::io::stdout(), events_rx);
    let reader = control::spawn_reader(tokio::io::stdin(), commands_tx, events.clone());
    logs::install_sink(events);
    spawn_signal_handler(shutdown);

    worker.run().await;

    // Drop every sender so the writer drains and exits.
    logs::uninstall_sink();
    reader.abort();
    let _ = reader.await;
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("event writer did not drain in time");
    }
    info!("relay-worker exiting");
    Ok(0)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received");
        shutdown.cancel();
    });
}
