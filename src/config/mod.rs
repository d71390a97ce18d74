mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialOptions;

pub use settings::{ExchangeKind, MqOptions, Topic, Topology, Tuning};

/// Loads client options from `path` and `MQ_*` environment variables.
///
/// The file format follows its extension (YAML, TOML, JSON). Environment
/// variables override file values, nested keys joined by `__`, e.g.
/// `MQ_HOST` or `MQ_TUNING__PUBLISH_TIMEOUT_MS`. Anything left unset falls
/// back to `MqOptions::default()`.
pub fn load_options(path: impl AsRef<Path>) -> Result<MqOptions, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path.as_ref()).required(true))
        .add_source(
            Environment::with_prefix("MQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    let partial: PartialOptions = config.try_deserialize()?;
    let options = partial.merge();

    options.validate().map_err(ConfigError::Message)?;

    Ok(options)
}
