use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use webshot_relay::{setup_logging, Cli, CliRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting webshot-relay v{}", env!("CARGO_PKG_VERSION"));

    let cli_runner = CliRunner::new(&args).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    // The server drains on its own; one-shot commands are simply abandoned.
    let result = cli_runner.run(args.command, shutdown_rx).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("webshot-relay stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use signal::unix::{signal as unix_signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        unix_signal(SignalKind::interrupt()),
        unix_signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C");
    }
}
