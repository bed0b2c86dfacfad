use convoy::relay::{DEFAULT_RELAY_PORT, RelayServer};
use tracing::info;

const RELAY_ADDR_ENV: &str = "CONVOY_RELAY_ADDR";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr =
        std::env::var(RELAY_ADDR_ENV).unwrap_or_else(|_| format!("0.0.0.0:{}", DEFAULT_RELAY_PORT));

    println!("   Convoy Signaling Relay");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = RelayServer::new();
    tokio::select! {
        result = server.run(&bind_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
