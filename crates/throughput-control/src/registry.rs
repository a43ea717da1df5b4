//! Per-resource registry of throughput control group configurations.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use error_stack::Report;

use crate::{ControlGroupConfig, ThroughputControlError};

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) group_count: usize,
    /// False when an identical config was already present.
    pub(crate) inserted: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    groups: BTreeMap<String, ControlGroupConfig>,
    default_group: Option<String>,
}

/// Holds the named group configurations of one target resource.
///
/// Names are unique and at most one group is the default. Groups are never
/// removed; the registry lives as long as the resource handle that owns it.
#[derive(Debug, Default)]
pub struct ControlGroupRegistry {
    inner: RwLock<RegistryInner>,
}

impl ControlGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a group and returns the number of registered groups.
    ///
    /// Re-registering an identical config is a no-op.
    pub fn add_group(
        &self,
        config: ControlGroupConfig,
    ) -> Result<usize, Report<ThroughputControlError>> {
        self.register(config)
            .map(|registration| registration.group_count)
    }

    pub(crate) fn register(
        &self,
        config: ControlGroupConfig,
    ) -> Result<Registration, Report<ThroughputControlError>> {
        config.target()?;

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.groups.get(&config.group_name) {
            if *existing == config {
                return Ok(Registration {
                    group_count: inner.groups.len(),
                    inserted: false,
                });
            }
            return Err(Report::new(ThroughputControlError::GroupConflict {
                group_name: config.group_name.clone(),
            })
            .attach_printable(format!("existing: {existing:?}"))
            .attach_printable(format!("requested: {config:?}")));
        }

        if config.is_default {
            if let Some(existing) = &inner.default_group {
                return Err(Report::new(ThroughputControlError::DefaultGroupConflict {
                    existing: existing.clone(),
                })
                .attach_printable(format!(
                    "cannot make `{}` the default, `{existing}` already is",
                    config.group_name
                )));
            }
            inner.default_group = Some(config.group_name.clone());
        }

        tracing::debug!(
            group_name = %config.group_name,
            is_default = config.is_default,
            "Registered throughput control group"
        );

        inner.groups.insert(config.group_name.clone(), config);
        Ok(Registration {
            group_count: inner.groups.len(),
            inserted: true,
        })
    }

    pub fn get_group(&self, group_name: &str) -> Option<ControlGroupConfig> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .get(group_name)
            .cloned()
    }

    pub fn default_group(&self) -> Option<ControlGroupConfig> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .default_group
            .as_ref()
            .and_then(|name| inner.groups.get(name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered group names in lexical order.
    pub fn group_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .keys()
            .cloned()
            .collect()
    }
}
