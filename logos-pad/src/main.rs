//! logos-pad server binary.

use std::time::Duration;

use clap::Parser;

use logos_pad::server::{HubServer, ServerConfig, DEFAULT_QUEUE_CAPACITY};

#[derive(Debug, Parser)]
#[command(name = "logos-pad", version, about = "Real-time collaborative text editing hub")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Outbound messages buffered per connection before it is evicted
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Seconds allowed for the WebSocket upgrade
    #[arg(long, default_value_t = 5)]
    handshake_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let server = HubServer::new(ServerConfig {
        bind_addr: args.bind,
        queue_capacity: args.queue_capacity,
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
    });

    log::info!("Starting logos-pad on {}", server.bind_addr());
    server.run().await?;
    Ok(())
}
