use std::sync::Arc;

use tracing::{error, info};

use super::{
    config::Config,
    database::{RedisVoteStore, VoteStore},
};

pub struct AppState<S> {
    pub config: Config,
    pub store: S,
}

impl AppState<RedisVoteStore> {
    /// Load configuration and establish the store connection. Any
    /// failure here is fatal: the process logs and exits instead of
    /// serving requests it cannot persist.
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        info!("Connecting to vote store...");
        let store = RedisVoteStore::connect(&config.connection_string)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to connect to vote store: {e}");
                std::process::exit(1);
            });

        store
            .ensure_provisioned(config.capacity_bytes)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to provision vote store: {e}");
                std::process::exit(1);
            });

        Arc::new(Self { config, store })
    }
}
