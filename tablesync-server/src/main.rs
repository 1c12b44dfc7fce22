use std::error::Error;

use log::info;
use tablesync_collab::documents::InMemoryRepository;
use tablesync_collab::server::{ServerConfig, SyncServer};
use tablesync_collab::session::RedisBackend;

/// Path to a JSON array of sheet records served by this instance.
const SHEETS_ENV: &str = "TABLESYNC_SHEETS";

fn load_sheets() -> Result<InMemoryRepository, Box<dyn Error>> {
    match std::env::var(SHEETS_ENV) {
        Ok(path) => {
            let repo = InMemoryRepository::load(&path)?;
            info!("Loaded sheets from {path}");
            Ok(repo)
        }
        Err(_) => {
            log::warn!("{SHEETS_ENV} is not set; every connection will be refused");
            Ok(InMemoryRepository::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting tablesync server...");

    let config = ServerConfig::from_env();
    let repository = load_sheets()?;
    let backend = RedisBackend::connect(&config.redis_url).await?;

    let server = SyncServer::new(config, backend, repository);
    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
