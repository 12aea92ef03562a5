//! rpcmux server - main entry point.
//!
//! Serves the built-in services (`srv`, `config`, `log`, `events`) until
//! interrupted or shut down through `srv.shutdown`.

use clap::Parser;
use rpcmux::cli::ServerArgs;
use rpcmux::RpcServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();

    // Initialize observability
    rpcmux::observability::init_tracing();

    let server = RpcServer::start(args.options(), Vec::new()).await?;
    tracing::info!("rpcmux server listening on port {}", server.port());

    tokio::select! {
        _ = server.wait_shutdown() => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, shutting down");
            server.shutdown().await?;
        }
    }
    Ok(())
}
