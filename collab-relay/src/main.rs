use collab_relay::{RelayServer, ServerConfig};
use log::info;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting collaboration relay on {} (default document {:?})",
        config.bind_addr(),
        config.default_document
    );

    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} frames relayed, {} rejected",
                stats.total_connections, stats.frames_relayed, stats.frames_rejected
            );
        }
    }
}
