use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use wsync::cli::DaemonOpts;
use wsync::config::{load_settings, settings_path};
use wsync::{logger, Server};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let _log_guard = logger::init(opts.verbose, opts.log_dir.as_deref());

    let config_path = opts.config.clone().unwrap_or_else(settings_path);
    let settings = load_settings(&config_path);
    let root = opts.root.clone().unwrap_or(settings.host.content_root.clone());
    let bind = opts.bind.clone().unwrap_or_else(|| settings.host.bind_addr());

    // Validate root directory exists and is a directory
    if !root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", root.display());
    }
    let canonical_root = std::fs::canonicalize(&root)
        .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))?;

    println!("Starting wsync host:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", bind);

    if bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the host to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; use trusted networks only");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let server = Server::bind(&bind, canonical_root)
            .await
            .with_context(|| format!("bind {}", bind))?;
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    eprintln!("\nInterrupted, shutting down...");
                    let _ = tx.send(true);
                }
                Err(e) => {
                    tracing::warn!("cannot listen for Ctrl-C: {}", e);
                    // Dropping tx would stop the host
                    std::future::pending::<()>().await;
                }
            }
        });
        server.run(rx).await?;
        Ok::<(), anyhow::Error>(())
    })
}
