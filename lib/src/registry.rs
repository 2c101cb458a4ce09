//! Parsed configurations and the metrics they define.

use {
    crate::{
        error::{Abort, Error, HandleError},
        handles::{ConfigId, HostConfig, MetricId},
        host::{Host, MetricKind},
        status::Status,
    },
    cranelift_entity::PrimaryMap,
    std::{collections::HashMap, fmt, sync::Arc},
};

/// Parsed extension configurations, indexed by the id handed back to the host.
///
/// Entries are read-only once inserted and shared across requests. Destroyed entries leave a
/// tombstone, so ids are never reused.
pub(crate) struct ConfigStore<C> {
    configs: PrimaryMap<ConfigId, Option<Arc<C>>>,
}

impl<C> Default for ConfigStore<C> {
    fn default() -> Self {
        Self {
            configs: PrimaryMap::new(),
        }
    }
}

impl<C> ConfigStore<C> {
    pub(crate) fn insert(&mut self, config: C) -> ConfigId {
        self.configs.push(Some(Arc::new(config)))
    }

    pub(crate) fn get(&self, id: ConfigId) -> Result<Arc<C>, HandleError> {
        self.configs
            .get(id)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or(HandleError::InvalidConfigHandle(id))
    }

    pub(crate) fn remove(&mut self, id: ConfigId) -> Result<Arc<C>, HandleError> {
        self.configs
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(HandleError::InvalidConfigHandle(id))
    }

    /// Number of configurations not yet destroyed.
    pub(crate) fn live(&self) -> usize {
        self.configs.values().filter(|c| c.is_some()).count()
    }
}

/// What a configuration can reach while it is being parsed.
pub struct ConfigScope {
    host: Arc<dyn Host>,
    host_config: HostConfig,
    metrics: HashMap<(MetricKind, String), MetricId>,
}

impl ConfigScope {
    pub(crate) fn new(host: Arc<dyn Host>, host_config: HostConfig) -> Self {
        Self {
            host,
            host_config,
            metrics: HashMap::new(),
        }
    }

    pub fn host_config(&self) -> HostConfig {
        self.host_config
    }

    /// Define a metric, or return the one already defined under the same kind and name.
    pub fn define_metric(&mut self, kind: MetricKind, name: &str) -> Result<Metric, Error> {
        let key = (kind, name.to_owned());
        let id = match self.metrics.get(&key) {
            Some(&id) => id,
            None => {
                let id = metric_call(
                    "define_metric",
                    self.host.define_metric(self.host_config, kind, name),
                )?;
                tracing::debug!(%id, ?kind, name, "defined metric");
                self.metrics.insert(key, id);
                id
            }
        };
        Ok(Metric {
            host: self.host.clone(),
            config: self.host_config,
            id,
            kind,
        })
    }
}

/// A counter, gauge or histogram bound to the configuration that defined it.
///
/// Any failure from the host here means the metric was misused, so every failure aborts.
#[derive(Clone)]
pub struct Metric {
    host: Arc<dyn Host>,
    config: HostConfig,
    id: MetricId,
    kind: MetricKind,
}

impl Metric {
    pub fn id(&self) -> MetricId {
        self.id
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Add `offset` to a counter or gauge. Gauges accept negative offsets.
    pub fn increment(&self, offset: i64) -> Result<(), Error> {
        metric_call(
            "increment_metric",
            self.host.increment_metric(self.config, self.id, offset),
        )
    }

    pub fn get(&self) -> Result<u64, Error> {
        metric_call("get_metric", self.host.get_metric(self.config, self.id))
    }

    pub fn record(&self, value: u64) -> Result<(), Error> {
        metric_call(
            "record_metric",
            self.host.record_metric(self.config, self.id, value),
        )
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

fn metric_call<T>(call: &'static str, res: Result<T, Status>) -> Result<T, Error> {
    res.map_err(|status| {
        tracing::error!(call, "metric call failed: {status}");
        Abort::new(call, status).into()
    })
}
