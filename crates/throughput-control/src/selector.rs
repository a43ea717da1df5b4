use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use error_stack::Report;

use crate::{ControlGroupConfig, ControlGroupRegistry, RequestThrottler, ThroughputControlError};

/// Throttler a request is routed to.
#[derive(Debug, Clone)]
pub enum ResolvedGroup {
    Regulated(Arc<RequestThrottler>),
    /// No group applies; the request runs without admission control.
    Unregulated,
}

impl ResolvedGroup {
    pub fn throttler(&self) -> Option<&Arc<RequestThrottler>> {
        match self {
            Self::Regulated(throttler) => Some(throttler),
            Self::Unregulated => None,
        }
    }

    pub fn is_regulated(&self) -> bool {
        matches!(self, Self::Regulated(_))
    }
}

/// Routes requests to the throttler of their control group.
///
/// A group counts as found only once it is registered *and* initialized. Groups
/// that failed to initialize under `suppress_init_error` fall back to the
/// default group, or run unregulated when that is unavailable too.
#[derive(Debug)]
pub struct GroupSelector {
    registry: Arc<ControlGroupRegistry>,
    throttlers: RwLock<HashMap<String, Arc<RequestThrottler>>>,
}

impl GroupSelector {
    pub fn new(registry: Arc<ControlGroupRegistry>) -> Self {
        Self {
            registry,
            throttlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ControlGroupRegistry> {
        &self.registry
    }

    /// Marks a registered group as initialized.
    pub(crate) fn insert_throttler(&self, throttler: Arc<RequestThrottler>) {
        self.throttlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(throttler.group_name().to_string(), throttler);
    }

    pub fn throttler(&self, group_name: &str) -> Option<Arc<RequestThrottler>> {
        self.throttlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_name)
            .cloned()
    }

    pub fn resolve(
        &self,
        group_name: Option<&str>,
    ) -> Result<ResolvedGroup, Report<ThroughputControlError>> {
        let Some(group_name) = group_name else {
            return self.resolve_default();
        };

        if let Some(throttler) = self.throttler(group_name) {
            return Ok(ResolvedGroup::Regulated(throttler));
        }

        match self.registry.get_group(group_name) {
            Some(config) if config.suppress_init_error => {
                tracing::debug!(
                    group_name = %group_name,
                    "Group is not initialized, falling back to the default group"
                );
                self.resolve_default()
            }
            Some(config) => Err(not_initialized(&config)),
            None => Err(Report::new(ThroughputControlError::UnknownGroup {
                group_name: group_name.to_string(),
            })),
        }
    }

    fn resolve_default(&self) -> Result<ResolvedGroup, Report<ThroughputControlError>> {
        let Some(config) = self.registry.default_group() else {
            return Ok(ResolvedGroup::Unregulated);
        };

        match self.throttler(&config.group_name) {
            Some(throttler) => Ok(ResolvedGroup::Regulated(throttler)),
            None if config.suppress_init_error => Ok(ResolvedGroup::Unregulated),
            None => Err(not_initialized(&config)),
        }
    }
}

fn not_initialized(config: &ControlGroupConfig) -> Report<ThroughputControlError> {
    Report::new(ThroughputControlError::InitializationFailed {
        group_name: config.group_name.clone(),
    })
    .attach_printable("group is registered but was never initialized")
}
