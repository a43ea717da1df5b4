//! Fair sharing of one group's budget across cooperating client processes.
//!
//! Every instance periodically rewrites the group's [`ControlRecord`]: it drops
//! expired leases, refreshes its own and derives
//! `share = total_throughput / live_instances`. The share is cached in an atomic
//! so the group's renewal tick never touches the store.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use error_stack::{Report, ResultExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::atomic::AtomicF64;
use crate::{
    CasOutcome, ControlRecord, ControlRecordStore, GlobalControlConfig, LinkedCancellationToken,
    StoreError, ThroughputControlError, CONTROL_RECORD_SCHEMA_VERSION,
};

const MAX_CAS_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Milliseconds since the Unix epoch, used for lease timestamps.
pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Reconciles the share of one globally controlled group.
pub struct GlobalThroughputCoordinator {
    group_name: String,
    client_id: String,
    config: GlobalControlConfig,
    store: Arc<dyn ControlRecordStore>,
    total_throughput: AtomicF64,
    share: AtomicF64,
    active_instances: AtomicUsize,
    /// Set once a fatal error stopped reconciliation.
    halted: AtomicBool,
}

impl std::fmt::Debug for GlobalThroughputCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalThroughputCoordinator")
            .field("group_name", &self.group_name)
            .field("client_id", &self.client_id)
            .field("total_throughput", &self.total_throughput())
            .field("share", &self.current_share())
            .field("active_instances", &self.active_instances())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl GlobalThroughputCoordinator {
    /// Creates a coordinator that has not reconciled yet. Its share starts at
    /// the full `total_throughput`.
    pub fn new(
        group_name: impl Into<String>,
        total_throughput: f64,
        config: GlobalControlConfig,
        store: Arc<dyn ControlRecordStore>,
    ) -> Self {
        let client_id = format!("{}-{}", config.client_id_prefix, Uuid::new_v4());
        Self {
            group_name: group_name.into(),
            client_id,
            config,
            store,
            total_throughput: AtomicF64::new(total_throughput),
            share: AtomicF64::new(total_throughput),
            active_instances: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &GlobalControlConfig {
        &self.config
    }

    /// Last computed share, read by the renewal tick.
    pub fn current_share(&self) -> f64 {
        self.share.load()
    }

    pub fn total_throughput(&self) -> f64 {
        self.total_throughput.load()
    }

    /// Live instances seen in the last successful round; 0 before the first one.
    pub fn active_instances(&self) -> usize {
        self.active_instances.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Updates the group total, e.g. after the provisioned throughput changed.
    ///
    /// The share is rescaled locally; peers pick the new total up on the next round.
    pub fn set_total_throughput(&self, total_throughput: f64) {
        let previous = self.total_throughput.swap(total_throughput);
        if previous == total_throughput {
            return;
        }
        let instances = self.active_instances().max(1);
        self.update_share(total_throughput / instances as f64, instances);
    }

    /// Runs the first reconciliation round.
    ///
    /// A transient failure is tolerated with `suppress_init_error`, in which
    /// case the full total is used as the share until a later round succeeds.
    /// A schema mismatch always fails.
    pub async fn initialize(
        &self,
        suppress_init_error: bool,
    ) -> Result<f64, Report<ThroughputControlError>> {
        match self.reconcile_at(unix_time_ms()).await {
            Ok(share) => Ok(share),
            Err(report) if is_fatal(&report) => Err(report),
            Err(report) if suppress_init_error => {
                let total = self.total_throughput();
                tracing::warn!(
                    group_name = %self.group_name,
                    share = total,
                    error = ?report,
                    "Initial reconciliation failed, using the full group throughput"
                );
                self.share.store(total);
                Ok(total)
            }
            Err(report) => Err(report.change_context(ThroughputControlError::InitializationFailed {
                group_name: self.group_name.clone(),
            })),
        }
    }

    /// Runs one reconciliation round as of `now_ms` and returns the new share.
    ///
    /// On error the previous share is kept.
    pub async fn reconcile_at(&self, now_ms: u64) -> Result<f64, Report<ThroughputControlError>> {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let loaded = self
                .store
                .load(&self.group_name)
                .await
                .map_err(|report| self.load_failure(report))?;

            let total = self.total_throughput();
            let (mut record, expected_version) = match loaded {
                Some(record) => {
                    let version = record.version;
                    (record, Some(version))
                }
                None => (ControlRecord::new(self.group_name.clone(), total), None),
            };

            if record.schema_version != CONTROL_RECORD_SCHEMA_VERSION {
                return Err(self.schema_mismatch(Report::new(
                    ThroughputControlError::SchemaMismatch {
                        found: record.schema_version,
                        expected: CONTROL_RECORD_SCHEMA_VERSION,
                    },
                )));
            }

            record.total_throughput = total;
            let expired = record.prune_expired(now_ms);
            record.upsert_lease(&self.client_id, now_ms, self.config.effective_expire_interval());
            let instances = record.live_instances();

            match self
                .store
                .compare_and_swap(&self.group_name, expected_version, &record)
                .await
                .change_context_lazy(|| self.unavailable())?
            {
                CasOutcome::Swapped { version } => {
                    if !expired.is_empty() {
                        tracing::info!(
                            group_name = %self.group_name,
                            expired = ?expired,
                            "Reclaimed leases of expired instances"
                        );
                    }
                    tracing::trace!(
                        group_name = %self.group_name,
                        version = version,
                        instances = instances,
                        "Control record updated"
                    );
                    let share = total / instances as f64;
                    self.update_share(share, instances);
                    return Ok(share);
                }
                CasOutcome::Conflict => {
                    tracing::debug!(
                        group_name = %self.group_name,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Control record changed concurrently, retrying"
                    );
                    if attempt < MAX_CAS_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }

        Err(Report::new(self.unavailable()).attach_printable(format!(
            "gave up after {MAX_CAS_ATTEMPTS} conflicting writes"
        )))
    }

    /// Reconciles every `renew_interval` until `token` is cancelled, then
    /// releases this instance's lease.
    ///
    /// A schema mismatch stops the loop and keeps the last share.
    pub async fn run(self: Arc<Self>, token: LinkedCancellationToken) {
        let renew_interval = self.config.renew_interval;
        let mut ticker = interval_at(Instant::now() + renew_interval, renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            group_name = %self.group_name,
            client_id = %self.client_id,
            renew_interval = ?renew_interval,
            "Starting global throughput coordinator"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(group_name = %self.group_name, "Global throughput coordinator shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.reconcile_at(unix_time_ms()).await {
                        Ok(_) => {}
                        Err(report) if is_fatal(&report) => {
                            tracing::error!(
                                group_name = %self.group_name,
                                share = self.current_share(),
                                error = ?report,
                                "Stopping reconciliation, keeping the last share"
                            );
                            return;
                        }
                        Err(report) => {
                            tracing::warn!(
                                group_name = %self.group_name,
                                share = self.current_share(),
                                error = ?report,
                                "Reconciliation failed, reusing the last share"
                            );
                        }
                    }
                }
            }
        }

        self.release().await;
        tracing::info!(group_name = %self.group_name, "Global throughput coordinator stopped");
    }

    /// Removes this instance's lease so peers regain its share. Best effort.
    pub async fn release(&self) {
        if self.is_halted() {
            return;
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = match self.store.load(&self.group_name).await {
                Ok(Some(record)) if record.schema_version == CONTROL_RECORD_SCHEMA_VERSION => record,
                Ok(_) => return,
                Err(report) => {
                    tracing::debug!(group_name = %self.group_name, error = ?report, "Could not release lease");
                    return;
                }
            };

            let expected_version = record.version;
            let mut record = record;
            if !record.remove_lease(&self.client_id) {
                return;
            }

            match self
                .store
                .compare_and_swap(&self.group_name, Some(expected_version), &record)
                .await
            {
                Ok(CasOutcome::Swapped { .. }) => {
                    tracing::debug!(
                        group_name = %self.group_name,
                        client_id = %self.client_id,
                        "Released lease"
                    );
                    return;
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(report) => {
                    tracing::debug!(group_name = %self.group_name, error = ?report, "Could not release lease");
                    return;
                }
            }
        }
    }

    fn update_share(&self, share: f64, instances: usize) {
        let previous_instances = self.active_instances.swap(instances, Ordering::AcqRel);
        let previous = self.share.swap(share);
        if previous != share || previous_instances != instances {
            tracing::info!(
                group_name = %self.group_name,
                share = share,
                previous_share = previous,
                instances = instances,
                "Global throughput share changed"
            );
        }
    }

    /// Store failures are transient unless the stored record uses another schema.
    fn load_failure(&self, report: Report<StoreError>) -> Report<ThroughputControlError> {
        let unsupported = match report.current_context() {
            StoreError::UnsupportedSchema { found } => Some(*found),
            _ => None,
        };
        match unsupported {
            Some(found) => {
                self.schema_mismatch(report.change_context(ThroughputControlError::SchemaMismatch {
                    found,
                    expected: CONTROL_RECORD_SCHEMA_VERSION,
                }))
            }
            None => report.change_context(self.unavailable()),
        }
    }

    fn schema_mismatch(
        &self,
        report: Report<ThroughputControlError>,
    ) -> Report<ThroughputControlError> {
        self.halted.store(true, Ordering::Release);
        report.attach_printable(format!("group: {}", self.group_name))
    }

    fn unavailable(&self) -> ThroughputControlError {
        ThroughputControlError::ControlStoreUnavailable {
            group_name: self.group_name.clone(),
        }
    }
}

fn is_fatal(report: &Report<ThroughputControlError>) -> bool {
    matches!(
        report.current_context(),
        ThroughputControlError::SchemaMismatch { .. }
    )
}
