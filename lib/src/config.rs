//! Bridge configuration, read from an `isthmus.toml` file.

use {
    crate::{error::BridgeConfigError, logging::LogLevel},
    serde_derive::Deserialize,
    std::{convert::TryInto, fs, path::Path, str::FromStr},
    toml::value::{Table, Value},
};


/// Types and deserializers for the reference host's seed data.
mod local_host;
pub use self::local_host::LocalHostConfig;

/// Configuration for a bridge and the extension it runs.
///
/// This `struct` represents the fields and values in an `isthmus.toml` file.
#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    log_level: LogLevel,
    plugin_name: String,
    plugin_config: Vec<u8>,
    local_host: LocalHostConfig,
}

impl BridgeConfig {
    /// The minimum level of extension log entries forwarded to the host.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Get a reference to the plugin name.
    pub fn plugin_name(&self) -> &str {
        self.plugin_name.as_str()
    }

    /// The `[plugin.config]` table, re-encoded as TOML text. These are the raw bytes handed to
    /// the extension's configuration parser.
    pub fn plugin_config(&self) -> &[u8] {
        &self.plugin_config
    }

    /// Get the seed data for the reference host.
    pub fn local_host(&self) -> &LocalHostConfig {
        &self.local_host
    }

    /// Parse an `isthmus.toml` file into a `BridgeConfig`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeConfigError> {
        fs::read_to_string(path.as_ref())
            .map_err(|err| BridgeConfigError::IoError {
                path: path.as_ref().display().to_string(),
                err,
            })
            .and_then(Self::from_str)
    }

    /// Parse a string containing TOML data into a `BridgeConfig`.
    fn from_str(toml: impl AsRef<str>) -> Result<Self, BridgeConfigError> {
        toml::from_str::<'_, TomlBridgeConfig>(toml.as_ref())
            .map_err(Into::into)
            .and_then(TryInto::try_into)
    }
}

impl FromStr for BridgeConfig {
    type Err = BridgeConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

/// Internal deserializer used to read data from an `isthmus.toml` file.
///
/// Once a TOML file has been read using [`toml::from_str`], this can be converted into
/// a [`BridgeConfig`].
#[derive(Deserialize)]
struct TomlBridgeConfig {
    bridge: Option<RawBridgeConfig>,
    plugin: Option<RawPluginConfig>,
    local_host: Option<Table>,
}

#[derive(Deserialize)]
struct RawBridgeConfig {
    log_level: Option<String>,
}

#[derive(Deserialize)]
struct RawPluginConfig {
    name: Option<String>,
    config: Option<Table>,
}

impl TryInto<BridgeConfig> for TomlBridgeConfig {
    type Error = BridgeConfigError;
    fn try_into(self) -> Result<BridgeConfig, Self::Error> {
        let Self {
            bridge,
            plugin,
            local_host,
        } = self;

        let log_level = match bridge.and_then(|b| b.log_level) {
            Some(level) => level
                .parse()
                .map_err(|()| BridgeConfigError::InvalidLogLevel(level))?,
            None => LogLevel::default(),
        };

        let (plugin_name, plugin_config) = match plugin {
            Some(RawPluginConfig { name, config }) => {
                let config = match config {
                    Some(table) => toml::to_string(&Value::Table(table))?.into_bytes(),
                    None => Vec::new(),
                };
                (name.unwrap_or_default(), config)
            }
            None => Default::default(),
        };

        let local_host = local_host
            .map(TryInto::try_into)
            .transpose()?
            .unwrap_or_default();

        Ok(BridgeConfig {
            log_level,
            plugin_name,
            plugin_config,
            local_host,
        })
    }
}
