//! Shared configuration loading.

use serde::de::DeserializeOwned;

use crate::error::HubError;

/// Load a typed configuration section.
///
/// Layers an optional `<name>.toml`/`<name>.yaml` file in the working
/// directory under `HIVEOT__`-prefixed environment variables, so
/// `HIVEOT__SERVER__PORT=8444` overrides `[server] port`.
pub fn load<T: DeserializeOwned>(name: &str) -> Result<T, HubError> {
    dotenvy::dotenv().ok();

    let cfg = config::Config::builder()
        .add_source(config::File::with_name(name).required(false))
        .add_source(config::Environment::with_prefix("HIVEOT").separator("__"))
        .build()?;

    Ok(cfg.try_deserialize()?)
}
