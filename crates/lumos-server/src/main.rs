//! `lumosd` – the Lumos kernel daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lumos_kernel::{Kernel, KernelConfig};

#[derive(Parser)]
#[command(name = "lumosd", about = "Self-hosted LLM operating system kernel")]
struct Args {
    /// Root directory for persisted state.
    #[arg(long)]
    data_root: Option<std::path::PathBuf>,
    /// Bind address; `HOST` applies when absent.
    #[arg(long)]
    host: Option<String>,
    /// Bind port; `PORT` applies when absent.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = KernelConfig::from_env();
    if let Some(data_root) = args.data_root {
        config.data_root = data_root;
    }

    let host = args
        .host
        .or_else(|| std::env::var("HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8600);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let kernel = Kernel::boot(config).await;
    kernel.monitor.probe().await;

    let router = lumos_server::build_router(kernel.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    kernel.spawn_background();

    let shutdown_kernel: Arc<Kernel> = kernel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_kernel.shutdown().await;
        })
        .await?;

    Ok(())
}
