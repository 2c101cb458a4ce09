use {
    crate::host::WellKnownValue,
    serde_json::{Map, Value as JsonValue},
    std::collections::{HashMap, HashSet},
};

/// Seed data for the reference host, from the `[local_host]` section of `isthmus.toml`.
#[derive(Clone, Debug, Default)]
pub struct LocalHostConfig {
    pub properties: HashMap<String, String>,
    pub filter_state: HashMap<String, String>,
    /// Structured fields per metadata namespace.
    pub dynamic_metadata: HashMap<String, Map<String, JsonValue>>,
    pub string_values: HashMap<WellKnownValue, String>,
    pub integer_values: HashMap<WellKnownValue, u64>,
    /// Property, filter-state and metadata-namespace keys whose lookups suspend until the host
    /// completes them.
    pub deferred: HashSet<String>,
}

/// This module contains [`TryFrom`] implementations used when deserializing an `isthmus.toml`.
///
/// These implementations are called indirectly by [`BridgeConfig::from_file`][super::BridgeConfig],
/// and help validate that we have been given an appropriate TOML schema. If the configuration is
/// not valid, a [`BridgeConfigError`] will be returned.
mod deserialization {
    use {
        super::LocalHostConfig,
        crate::{
            error::{BridgeConfigError, LocalHostConfigError},
            host::WellKnownValue,
        },
        serde_json::Value as JsonValue,
        std::{
            collections::{HashMap, HashSet},
            convert::TryFrom,
        },
        toml::value::{Table, Value},
    };

    fn into_table(value: Value) -> Result<Table, LocalHostConfigError> {
        match value {
            Value::Table(table) => Ok(table),
            _ => Err(LocalHostConfigError::InvalidEntryType),
        }
    }

    /// Return an [`LocalHostConfigError::UnrecognizedKey`] error if any unrecognized keys are
    /// found.
    ///
    /// This should be called after we have removed and validated the keys we expect in a
    /// [`Table`].
    fn check_for_unrecognized_keys(table: &Table) -> Result<(), LocalHostConfigError> {
        if let Some(key) = table.keys().next() {
            Err(LocalHostConfigError::UnrecognizedKey(key.to_owned()))
        } else {
            Ok(())
        }
    }

    fn section<T>(
        toml: &mut Table,
        name: &'static str,
        process: impl FnOnce(Value) -> Result<T, LocalHostConfigError>,
    ) -> Result<Option<T>, BridgeConfigError> {
        toml.remove(name)
            .map(process)
            .transpose()
            .map_err(|err| BridgeConfigError::InvalidLocalHostDefinition { section: name, err })
    }

    fn string_table(value: Value) -> Result<HashMap<String, String>, LocalHostConfigError> {
        into_table(value)?
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(value) => Ok((key, value)),
                _ => Err(LocalHostConfigError::InvalidStringEntry(key)),
            })
            .collect()
    }

    fn well_known(key: String) -> Result<WellKnownValue, LocalHostConfigError> {
        WellKnownValue::from_name(&key).ok_or(LocalHostConfigError::UnknownWellKnownValue(key))
    }

    fn string_values(
        value: Value,
    ) -> Result<HashMap<WellKnownValue, String>, LocalHostConfigError> {
        string_table(value)?
            .into_iter()
            .map(|(key, value)| well_known(key).map(|key| (key, value)))
            .collect()
    }

    fn integer_values(value: Value) -> Result<HashMap<WellKnownValue, u64>, LocalHostConfigError> {
        into_table(value)?
            .into_iter()
            .map(|(key, value)| match value {
                Value::Integer(n) if n >= 0 => Ok((well_known(key)?, n as u64)),
                _ => Err(LocalHostConfigError::InvalidIntegerEntry(key)),
            })
            .collect()
    }

    fn dynamic_metadata(
        value: Value,
    ) -> Result<HashMap<String, serde_json::Map<String, JsonValue>>, LocalHostConfigError> {
        into_table(value)?
            .into_iter()
            .map(|(namespace, fields)| {
                let fields = into_table(fields)?;
                match serde_json::to_value(&fields) {
                    Ok(JsonValue::Object(fields)) => Ok((namespace, fields)),
                    Ok(_) => Err(LocalHostConfigError::InvalidEntryType),
                    Err(err) => Err(LocalHostConfigError::InvalidMetadata {
                        key: namespace,
                        err,
                    }),
                }
            })
            .collect()
    }

    fn deferred(value: Value) -> Result<HashSet<String>, LocalHostConfigError> {
        match value {
            Value::Array(keys) => keys
                .into_iter()
                .map(|key| match key {
                    Value::String(key) => Ok(key),
                    _ => Err(LocalHostConfigError::InvalidDeferredList),
                })
                .collect(),
            _ => Err(LocalHostConfigError::InvalidDeferredList),
        }
    }

    impl TryFrom<Table> for LocalHostConfig {
        type Error = BridgeConfigError;
        fn try_from(mut toml: Table) -> Result<Self, Self::Error> {
            let config = LocalHostConfig {
                properties: section(&mut toml, "properties", string_table)?.unwrap_or_default(),
                filter_state: section(&mut toml, "filter_state", string_table)?
                    .unwrap_or_default(),
                dynamic_metadata: section(&mut toml, "dynamic_metadata", dynamic_metadata)?
                    .unwrap_or_default(),
                string_values: section(&mut toml, "string_values", string_values)?
                    .unwrap_or_default(),
                integer_values: section(&mut toml, "integer_values", integer_values)?
                    .unwrap_or_default(),
                deferred: section(&mut toml, "deferred", deferred)?.unwrap_or_default(),
            };
            check_for_unrecognized_keys(&toml).map_err(|err| {
                BridgeConfigError::InvalidLocalHostDefinition {
                    section: "local_host",
                    err,
                }
            })?;
            Ok(config)
        }
    }
}
