use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use tracing::info;

/// Form echo server for formprobe scenarios
#[derive(Parser)]
#[command(name = "formprobe-echo", version, about)]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "PORT", default_value_t = 0)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(args.host, args.port)).await?;
    let port = listener.local_addr()?.port();

    // The harness waits for this exact line on stdout.
    println!("{}", formprobe_echo::readiness_line(port));
    info!("Listening on {}", listener.local_addr()?);

    formprobe_echo::serve(listener, shutdown_signal()).await?;
    info!("Echo server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
