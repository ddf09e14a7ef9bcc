use featherchat::error::Result;
use featherchat::{serve, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config_file = std::env::args().nth(1).unwrap_or_else(|| "config/server".to_string());
    let config = NodeConfig::new(&config_file)?;
    log::info!(
        "starting node on {} (db: {}, peers: [{}])",
        config.bind_addr,
        config.db_path,
        config.peers
    );

    serve(config).await
}
