use std::{env, fmt::Display, process, str::FromStr};

use tracing::{error, info};

use crate::database::DEFAULT_CAPACITY_BYTES;

pub struct Config {
    pub port: u16,
    pub connection_string: String,
    pub capacity_bytes: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("BEACON_PORT", "4000"),
            connection_string: require("CONNECTION_STRING"),
            capacity_bytes: try_load(
                "VOTES_CAPACITY_BYTES",
                &DEFAULT_CAPACITY_BYTES.to_string(),
            ),
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    env::var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .unwrap_or_else(|e| {
            error!("Invalid {key} value: {e}");
            process::exit(1);
        })
}

fn require(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        error!("Must specify {key} in environment");
        process::exit(1);
    })
}
