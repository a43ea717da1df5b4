//! Per-resource owner of every control group and its background work.

use core::future::Future;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::atomic::AtomicF64;
use crate::{
    ControlGroupConfig, ControlGroupRegistry, ControlRecordStore, ControllerSettings,
    GlobalControlConfig, GlobalThroughputCoordinator, GroupSelector, LinkedCancellationToken,
    LinkedCancellationTokenSource, ProvisionedThroughputSource, RequestCharge, RequestDescriptor,
    RequestError, RequestOptions, RequestThrottler, ResolvedGroup, ThroughputControlError,
    ThroughputTarget,
};

/// Where a group's scheduled throughput comes from at each renewal.
#[derive(Debug, Clone)]
enum Schedule {
    /// Fixed target, re-resolved when the provisioned throughput changes.
    Local(Arc<AtomicF64>),
    /// Fair share maintained by a coordinator.
    Global(Arc<GlobalThroughputCoordinator>),
}

impl Schedule {
    fn scheduled_throughput(&self) -> f64 {
        match self {
            Self::Local(target) => target.load(),
            Self::Global(coordinator) => coordinator.current_share(),
        }
    }

    fn set_total(&self, total: f64) {
        match self {
            Self::Local(target) => target.store(total),
            Self::Global(coordinator) => coordinator.set_total_throughput(total),
        }
    }
}

struct GroupRuntime {
    target: ThroughputTarget,
    schedule: Schedule,
    source: LinkedCancellationTokenSource,
    /// Kept alive for as long as the group; dropping it would stop the coordinator.
    _coordinator_source: Option<LinkedCancellationTokenSource>,
    tasks: Vec<JoinHandle<()>>,
}

/// Renewal loop of one group.
struct GroupRenewal {
    resource_id: String,
    throttler: Arc<RequestThrottler>,
    schedule: Schedule,
    target: ThroughputTarget,
    provisioned: Arc<dyn ProvisionedThroughputSource>,
    provisioned_refresh_interval: Duration,
}

impl GroupRenewal {
    async fn run(self, token: LinkedCancellationToken) {
        let renewal_interval = self.throttler.renewal_interval();
        let mut renewal = interval_at(Instant::now() + renewal_interval, renewal_interval);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval_at(
            Instant::now() + self.provisioned_refresh_interval,
            self.provisioned_refresh_interval,
        );
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let refresh_enabled = self.target.is_threshold();

        tracing::debug!(
            group_name = %self.throttler.group_name(),
            renewal_interval = ?renewal_interval,
            "Starting renewal loop"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(group_name = %self.throttler.group_name(), "Renewal loop shutdown requested");
                    break;
                }
                _ = renewal.tick() => {
                    let scheduled = self.schedule.scheduled_throughput();
                    let stats = self.throttler.renew_cycle(scheduled);
                    tracing::debug!(
                        target: "metrics.throughput_cycle",
                        tag_resource = %self.resource_id,
                        tag_group = %self.throttler.group_name(),
                        scheduled = scheduled,
                        available = self.throttler.available_throughput(),
                        admitted = stats.admitted,
                        rejected = stats.rejected,
                        cancelled = stats.cancelled,
                        charged = stats.charged
                    );
                }
                _ = refresh.tick(), if refresh_enabled => {
                    match self.provisioned.provisioned_throughput(&self.resource_id).await {
                        Ok(provisioned) => self.schedule.set_total(self.target.resolve(provisioned)),
                        Err(report) => tracing::warn!(
                            group_name = %self.throttler.group_name(),
                            error = ?report,
                            "Failed to refresh provisioned throughput, keeping the current target"
                        ),
                    }
                }
            }
        }
    }
}

/// Throughput control for one target resource.
///
/// Owns the group registry and every group's throttler, renewal loop and
/// optional coordinator. All background work hangs off one root cancellation
/// source: [`close`](Self::close), or dropping the controller, stops it all.
pub struct ThroughputController {
    resource_id: String,
    settings: ControllerSettings,
    registry: Arc<ControlGroupRegistry>,
    selector: GroupSelector,
    provisioned: Arc<dyn ProvisionedThroughputSource>,
    groups: Mutex<HashMap<String, GroupRuntime>>,
    root: LinkedCancellationTokenSource,
}

impl std::fmt::Debug for ThroughputController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThroughputController")
            .field("resource_id", &self.resource_id)
            .field("settings", &self.settings)
            .field("groups", &self.registry.group_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ThroughputController {
    pub fn new(
        resource_id: impl Into<String>,
        settings: ControllerSettings,
        provisioned: Arc<dyn ProvisionedThroughputSource>,
    ) -> Result<Self, Report<ThroughputControlError>> {
        settings.validate()?;
        let registry = Arc::new(ControlGroupRegistry::new());
        Ok(Self {
            resource_id: resource_id.into(),
            settings,
            selector: GroupSelector::new(registry.clone()),
            registry,
            provisioned,
            groups: Mutex::new(HashMap::new()),
            root: LinkedCancellationTokenSource::new(),
        })
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ControlGroupRegistry> {
        &self.registry
    }

    pub fn group_count(&self) -> usize {
        self.registry.len()
    }

    pub fn throttler(&self, group_name: &str) -> Option<Arc<RequestThrottler>> {
        self.selector.throttler(group_name)
    }

    pub fn coordinator(&self, group_name: &str) -> Option<Arc<GlobalThroughputCoordinator>> {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        match &groups.get(group_name)?.schedule {
            Schedule::Global(coordinator) => Some(coordinator.clone()),
            Schedule::Local(_) => None,
        }
    }

    /// Registers a locally controlled group and starts its renewal loop.
    ///
    /// Returns the number of registered groups. Re-adding an identical config
    /// is a no-op. When the target cannot be resolved the group stays
    /// registered; the error is returned unless `suppress_init_error` is set.
    pub async fn add_throughput_control_group(
        &self,
        config: ControlGroupConfig,
    ) -> Result<usize, Report<ThroughputControlError>> {
        self.ensure_open()?;
        let registration = self.registry.register(config.clone())?;
        if !registration.inserted {
            return Ok(registration.group_count);
        }

        let target = config.target()?;
        let Some(total) = self.resolve_initial_total(&config, target).await? else {
            return Ok(registration.group_count);
        };

        let schedule = Schedule::Local(Arc::new(AtomicF64::new(total)));
        self.start_group(&config, target, schedule, total, None);
        Ok(registration.group_count)
    }

    /// Registers a group whose budget is shared with other client processes
    /// through `store`.
    ///
    /// Runs the first reconciliation before returning. A schema mismatch in the
    /// stored record always fails.
    pub async fn enable_global_throughput_control_group(
        &self,
        config: ControlGroupConfig,
        global_config: GlobalControlConfig,
        store: Arc<dyn ControlRecordStore>,
    ) -> Result<usize, Report<ThroughputControlError>> {
        self.ensure_open()?;
        global_config.validate()?;
        let registration = self.registry.register(config.clone())?;
        if !registration.inserted {
            return Ok(registration.group_count);
        }

        let target = config.target()?;
        let Some(total) = self.resolve_initial_total(&config, target).await? else {
            return Ok(registration.group_count);
        };

        let coordinator = Arc::new(GlobalThroughputCoordinator::new(
            config.group_name.clone(),
            total,
            global_config,
            store,
        ));
        let share = coordinator
            .initialize(config.suppress_init_error)
            .await
            .attach_printable_lazy(|| format!("resource: {}", self.resource_id))?;

        self.start_group(
            &config,
            target,
            Schedule::Global(coordinator.clone()),
            share,
            Some(coordinator),
        );
        Ok(registration.group_count)
    }

    /// Runs `operation` under the admission control of the group named in
    /// `options`, or of the default group.
    ///
    /// Requests that resolve to no group run unregulated. Without a caller
    /// token, a regulated request is cancelled when its group is shut down.
    pub async fn process_request<F, Fut, T, E>(
        &self,
        options: &RequestOptions,
        descriptor: &RequestDescriptor,
        cancel: Option<&LinkedCancellationToken>,
        operation: F,
    ) -> Result<T, RequestError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: RequestCharge,
        E: RequestCharge,
    {
        if self.is_closed() {
            return Err(RequestError::Cancelled);
        }

        let resolved = self
            .selector
            .resolve(options.throughput_control_group_name.as_deref())
            .map_err(RequestError::Configuration)?;

        match resolved {
            ResolvedGroup::Unregulated => {
                if cancel.is_some_and(LinkedCancellationToken::is_cancellation_requested) {
                    return Err(RequestError::Cancelled);
                }
                operation().await.map_err(RequestError::Executor)
            }
            ResolvedGroup::Regulated(throttler) => {
                let token = match cancel {
                    Some(token) => Some(token.clone()),
                    None => self.group_token(throttler.group_name()),
                };
                throttler
                    .process_request(descriptor, token.as_ref(), operation)
                    .await
            }
        }
    }

    /// Re-resolves every threshold-based group against the current provisioned
    /// throughput. The new value applies from the next renewal.
    pub async fn refresh_provisioned_throughput(
        &self,
    ) -> Result<(), Report<ThroughputControlError>> {
        let threshold_groups: Vec<(ThroughputTarget, Schedule)> = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|runtime| runtime.target.is_threshold())
            .map(|runtime| (runtime.target, runtime.schedule.clone()))
            .collect();
        if threshold_groups.is_empty() {
            return Ok(());
        }

        let provisioned = self
            .provisioned
            .provisioned_throughput(&self.resource_id)
            .await?;
        for (target, schedule) in threshold_groups {
            schedule.set_total(target.resolve(provisioned));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_closed()
    }

    /// Stops every renewal loop and coordinator. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.root.close();
        tracing::info!(resource_id = %self.resource_id, "Throughput controller closed");
    }

    /// Closes the controller and waits for its background tasks to finish,
    /// including lease release of global groups.
    pub async fn shutdown(&self) {
        self.close();
        let tasks: Vec<JoinHandle<()>> = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .flat_map(|runtime| runtime.tasks.drain(..))
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(resource_id = %self.resource_id, "Background task failed: {e}");
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Report<ThroughputControlError>> {
        if self.is_closed() {
            return Err(Report::new(ThroughputControlError::Closed)
                .attach_printable(format!("resource: {}", self.resource_id)));
        }
        Ok(())
    }

    /// Resolves the group total, or `None` when resolution failed but the
    /// group is allowed to stay uninitialized.
    async fn resolve_initial_total(
        &self,
        config: &ControlGroupConfig,
        target: ThroughputTarget,
    ) -> Result<Option<f64>, Report<ThroughputControlError>> {
        let provisioned = match target {
            ThroughputTarget::Absolute(total) => return Ok(Some(total)),
            ThroughputTarget::Threshold(_) => {
                self.provisioned
                    .provisioned_throughput(&self.resource_id)
                    .await
            }
        };

        match provisioned {
            Ok(provisioned) => Ok(Some(target.resolve(provisioned))),
            Err(report) if config.suppress_init_error => {
                tracing::warn!(
                    group_name = %config.group_name,
                    error = ?report,
                    "Failed to initialize throughput control group, requests will fall back"
                );
                Ok(None)
            }
            Err(report) => Err(report.change_context(
                ThroughputControlError::InitializationFailed {
                    group_name: config.group_name.clone(),
                },
            )),
        }
    }

    fn start_group(
        &self,
        config: &ControlGroupConfig,
        target: ThroughputTarget,
        schedule: Schedule,
        initial_throughput: f64,
        coordinator: Option<Arc<GlobalThroughputCoordinator>>,
    ) {
        let global = matches!(schedule, Schedule::Global(_));
        let throttler = Arc::new(RequestThrottler::new(
            config.group_name.clone(),
            initial_throughput,
            self.settings.renewal_interval,
        ));
        let source = LinkedCancellationTokenSource::linked(&self.root.token());

        let renewal = GroupRenewal {
            resource_id: self.resource_id.clone(),
            throttler: throttler.clone(),
            schedule: schedule.clone(),
            target,
            provisioned: self.provisioned.clone(),
            provisioned_refresh_interval: self.settings.provisioned_refresh_interval,
        };
        let mut tasks = vec![tokio::spawn(renewal.run(source.token()))];

        let coordinator_source = coordinator.map(|coordinator| {
            let coordinator_source = LinkedCancellationTokenSource::linked(&source.token());
            tasks.push(tokio::spawn(coordinator.run(coordinator_source.token())));
            coordinator_source
        });

        self.selector.insert_throttler(throttler);
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                config.group_name.clone(),
                GroupRuntime {
                    target,
                    schedule,
                    source,
                    _coordinator_source: coordinator_source,
                    tasks,
                },
            );

        tracing::info!(
            resource_id = %self.resource_id,
            group_name = %config.group_name,
            scheduled = initial_throughput,
            is_default = config.is_default,
            global = global,
            "Throughput control group initialized"
        );
    }

    fn group_token(&self, group_name: &str) -> Option<LinkedCancellationToken> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_name)
            .map(|runtime| runtime.source.token())
    }
}
