// Pigeon peer node daemon.

use anyhow::Context;
use pigeon_node::directory_client::DirectoryClientError;
use pigeon_node::{config, PeerNode};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut username: Option<String> = std::env::var("PIGEON_USERNAME").ok();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("pigeon-node {}", VERSION);
                return Ok(());
            }
            "--username" | "-u" => {
                username = Some(
                    args.next()
                        .context("--username requires a value")?,
                );
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    let username = username
        .context("no username: pass --username <name> or set PIGEON_USERNAME")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = PeerNode::start(&username, cfg).await?;
        match node.register().await {
            Ok(()) => {}
            Err(DirectoryClientError::UsernameTaken(name)) => {
                anyhow::bail!("username {name} is taken, pick a different one");
            }
            Err(e) => return Err(e).context("directory registration failed"),
        }
        let loops = node.spawn_loops();

        let mut inbox = node.subscribe().await;
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                println!("[{}] {}: {}", msg.timestamp.format("%H:%M:%S"), msg.from, msg.content);
            }
        });

        shutdown_signal().await?;
        node.shutdown().await;
        for handle in loops {
            let _ = handle.await;
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
