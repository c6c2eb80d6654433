use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = pine::cli::Args::parse();
    let cfg = pine::daemon::DaemonConfig {
        tree_dir: args.tree_dir,
        endpoint: args.endpoint,
        unprivileged: args.unprivileged,
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        token.cancel();
    });

    pine::daemon::run(cfg, shutdown).await
}
