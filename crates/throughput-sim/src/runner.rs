use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use throughput_control::{
    AtomicF64, ControlRecordStore, ControllerSettings, FixedProvisionedThroughput, InMemoryControlStore,
    LinkedCancellationToken, LinkedCancellationTokenSource, RequestDescriptor, RequestError,
    RequestOptions, ThroughputController,
};

use crate::backend::{not_found_every, BackendError, FakeBackend};
use crate::config::{SimConfig, WorkloadConfig};

/// Backoff after a server-side throttle, which carries no retry-after.
const SERVER_THROTTLE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct WorkloadCounters {
    succeeded: AtomicU64,
    not_found: AtomicU64,
    client_throttled: AtomicU64,
    server_throttled: AtomicU64,
    cancelled: AtomicU64,
    charged: AtomicF64,
}

impl WorkloadCounters {
    fn snapshot(&self) -> WorkloadReport {
        WorkloadReport {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            client_throttled: self.client_throttled.load(Ordering::Relaxed),
            server_throttled: self.server_throttled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            charged: self.charged.load(),
        }
    }
}

/// Outcome counts of one workload, summed over all instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    pub succeeded: u64,
    pub not_found: u64,
    pub client_throttled: u64,
    pub server_throttled: u64,
    pub cancelled: u64,
    pub charged: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimReport {
    pub resource_id: String,
    pub instances: usize,
    pub duration_ms: u64,
    pub workloads: BTreeMap<String, WorkloadReport>,
    /// Total charge per second billed by the backend.
    pub backend_throughput: f64,
    /// Requests that reached the backend and were not throttled by it.
    pub backend_requests: u64,
}

/// Simulates `instances` client processes sharing one resource and one control store.
pub struct Simulation {
    config: SimConfig,
    instances: usize,
    store: Arc<InMemoryControlStore>,
    backend: Arc<FakeBackend>,
}

impl Simulation {
    pub fn new(config: SimConfig, instances: usize) -> Self {
        let backend = Arc::new(FakeBackend::new(config.provisioned_throughput));
        Self {
            config,
            instances: instances.max(1),
            store: Arc::new(InMemoryControlStore::new()),
            backend,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<InMemoryControlStore> {
        &self.store
    }

    async fn start_instance(&self, instance: usize) -> Result<ThroughputController> {
        let settings: ControllerSettings = self.config.settings.clone();
        let controller = ThroughputController::new(
            self.config.resource_id.clone(),
            settings,
            Arc::new(FixedProvisionedThroughput(self.config.provisioned_throughput)),
        )
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("invalid controller settings")?;

        for group in &self.config.groups {
            let registered = match &group.global {
                Some(global) => {
                    let store: Arc<dyn ControlRecordStore> = self.store.clone();
                    controller
                        .enable_global_throughput_control_group(
                            group.config.clone(),
                            global.clone(),
                            store,
                        )
                        .await
                }
                None => {
                    controller
                        .add_throughput_control_group(group.config.clone())
                        .await
                }
            };
            registered
                .map_err(|report| anyhow::anyhow!("{report:?}"))
                .with_context(|| {
                    format!(
                        "instance {instance}: failed to set up group `{}`",
                        group.config.group_name
                    )
                })?;
        }

        tracing::info!(
            instance = instance,
            groups = controller.group_count(),
            "Simulated client instance started"
        );
        Ok(controller)
    }

    /// Runs every workload on every instance for `duration`.
    pub async fn run(&self, duration: Duration) -> Result<SimReport> {
        let mut controllers = Vec::with_capacity(self.instances);
        for instance in 0..self.instances {
            controllers.push(Arc::new(self.start_instance(instance).await?));
        }

        let counters: BTreeMap<String, Arc<WorkloadCounters>> = self
            .config
            .workloads
            .iter()
            .map(|workload| (workload.name.clone(), Arc::new(WorkloadCounters::default())))
            .collect();

        let stop = LinkedCancellationTokenSource::new();
        let mut workers = Vec::new();
        for controller in &controllers {
            for workload in &self.config.workloads {
                for _ in 0..workload.concurrency {
                    let worker = Worker {
                        controller: controller.clone(),
                        backend: self.backend.clone(),
                        workload: workload.clone(),
                        counters: counters
                            .get(&workload.name)
                            .cloned()
                            .unwrap_or_default(),
                    };
                    workers.push(tokio::spawn(worker.run(stop.token())));
                }
            }
        }

        let started = tokio::time::Instant::now();
        tokio::time::sleep(duration).await;
        stop.close();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::warn!("Workload worker failed: {e}");
            }
        }
        let elapsed = started.elapsed();

        for controller in &controllers {
            controller.shutdown().await;
        }

        let workloads: BTreeMap<String, WorkloadReport> = counters
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect();
        let billed: f64 = workloads.values().map(|report| report.charged).sum();
        let seconds = elapsed.as_secs_f64().max(f64::EPSILON);

        Ok(SimReport {
            resource_id: self.config.resource_id.clone(),
            instances: self.instances,
            duration_ms: elapsed.as_millis() as u64,
            workloads,
            backend_throughput: billed / seconds,
            backend_requests: self.backend.served(),
        })
    }
}

struct Worker {
    controller: Arc<ThroughputController>,
    backend: Arc<FakeBackend>,
    workload: WorkloadConfig,
    counters: Arc<WorkloadCounters>,
}

impl Worker {
    async fn run(self, stop: LinkedCancellationToken) {
        let options = match &self.workload.group {
            Some(group) => RequestOptions::new().with_throughput_control_group(group.clone()),
            None => RequestOptions::new(),
        };
        let descriptor = RequestDescriptor::new(self.workload.name.clone())
            .with_estimated_charge(self.workload.estimated_charge.unwrap_or(0.0));
        let fail_every = not_found_every(self.workload.not_found_ratio);
        let charge = self.workload.request_charge;
        let latency = self.workload.latency();

        while !stop.is_cancellation_requested() {
            let backend = self.backend.clone();
            let outcome = self
                .controller
                .process_request(&options, &descriptor, Some(&stop), || async move {
                    backend.execute(charge, latency, fail_every).await
                })
                .await;

            let backoff = match outcome {
                Ok(response) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .charged
                        .fetch_add(response.request_charge.unwrap_or(0.0));
                    None
                }
                Err(RequestError::Executor(BackendError::NotFound { charge })) => {
                    self.counters.not_found.fetch_add(1, Ordering::Relaxed);
                    self.counters.charged.fetch_add(charge);
                    None
                }
                Err(RequestError::Executor(BackendError::ServerThrottled)) => {
                    self.counters.server_throttled.fetch_add(1, Ordering::Relaxed);
                    Some(SERVER_THROTTLE_BACKOFF)
                }
                Err(RequestError::Throttled(throttled)) => {
                    self.counters.client_throttled.fetch_add(1, Ordering::Relaxed);
                    Some(throttled.retry_after)
                }
                Err(RequestError::Cancelled) => {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(RequestError::Configuration(report)) => {
                    tracing::error!(
                        workload = %self.workload.name,
                        error = ?report,
                        "Workload cannot be routed, stopping it"
                    );
                    break;
                }
            };

            if let Some(backoff) = backoff {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
