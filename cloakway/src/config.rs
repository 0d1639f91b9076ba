use std::os::unix::fs::PermissionsExt;

use anyhow::Result;
use cloakway_common::CloakwayConfig;
use config::{Config, Environment, File};
use tracing::*;

pub fn load_config() -> Result<CloakwayConfig> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_owned());

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

    let config: CloakwayConfig = Config::builder()
        .add_source(File::with_name(&path))
        .add_source(Environment::with_prefix("CLOAKWAY"))
        .build()?
        .try_deserialize()?;
    info!("Using config: {path}");
    Ok(config)
}
