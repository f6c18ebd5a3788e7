#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use courier::config::{CONFIG_ENV, find_config_file};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = find_config_file(std::env::var(CONFIG_ENV).ok().as_deref())?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let courier: courier::Courier = ron::from_str(&config_content)?;

    courier.run().await
}
