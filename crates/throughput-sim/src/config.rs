use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use throughput_control::{
    deserialize_f64_from_string, deserialize_optional_f64_from_string, ControlGroupConfig,
    ControllerSettings, GlobalControlConfig,
};

#[derive(Parser, Debug, Clone)]
#[command(about = "Drive throughput control groups against a simulated backend", long_about = None)]
pub struct Cli {
    #[arg(
        long,
        env = "THROUGHPUT_SIM_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the simulation YAML file"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "THROUGHPUT_SIM_DURATION_SECS",
        default_value_t = 30,
        help = "How long the workloads run"
    )]
    pub duration_secs: u64,

    #[arg(
        long,
        env = "THROUGHPUT_SIM_INSTANCES",
        default_value_t = 1,
        help = "Number of client processes sharing the control store"
    )]
    pub instances: usize,

    #[arg(
        long,
        env = "THROUGHPUT_SIM_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Cycle metrics in InfluxDB line protocol, e.g. logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,
}

impl Cli {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse simulation config")]
    Parse(#[from] serde_yaml::Error),
    #[error("workload `{workload}` refers to unknown group `{group}`")]
    UnknownGroup { workload: String, group: String },
    #[error("workload `{workload}`: {reason}")]
    InvalidWorkload { workload: String, reason: String },
    #[error("provisioned throughput must be positive, got {0}")]
    InvalidProvisionedThroughput(f64),
}

/// A control group, optionally shared across instances.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    #[serde(flatten)]
    pub config: ControlGroupConfig,
    #[serde(default)]
    pub global: Option<GlobalControlConfig>,
}

/// Closed-loop request generator bound to one group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    pub name: String,
    /// Explicit group; the default group is used when absent.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub request_charge: f64,
    /// Cost reserved at admission; zero when absent.
    #[serde(default, deserialize_with = "deserialize_optional_f64_from_string")]
    pub estimated_charge: Option<f64>,
    /// Fraction of requests that fail with a charged not-found error.
    #[serde(default, deserialize_with = "deserialize_optional_f64_from_string")]
    pub not_found_ratio: Option<f64>,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

impl WorkloadConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimConfig {
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    #[serde(deserialize_with = "deserialize_f64_from_string")]
    pub provisioned_throughput: f64,
    #[serde(default)]
    pub settings: ControllerSettings,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub workloads: Vec<WorkloadConfig>,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what the controller cannot: workload wiring and ranges.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.provisioned_throughput.is_finite() && self.provisioned_throughput > 0.0) {
            return Err(ConfigError::InvalidProvisionedThroughput(
                self.provisioned_throughput,
            ));
        }

        let groups: HashSet<&str> = self
            .groups
            .iter()
            .map(|group| group.config.group_name.as_str())
            .collect();

        for workload in &self.workloads {
            if let Some(group) = &workload.group {
                if !groups.contains(group.as_str()) {
                    return Err(ConfigError::UnknownGroup {
                        workload: workload.name.clone(),
                        group: group.clone(),
                    });
                }
            }
            if workload.concurrency == 0 {
                return Err(ConfigError::InvalidWorkload {
                    workload: workload.name.clone(),
                    reason: "concurrency must be at least 1".to_string(),
                });
            }
            if let Some(ratio) = workload.not_found_ratio {
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(ConfigError::InvalidWorkload {
                        workload: workload.name.clone(),
                        reason: format!("notFoundRatio must be within [0, 1], got {ratio}"),
                    });
                }
            }
        }
        Ok(())
    }
}

fn default_resource_id() -> String {
    "simulated-container".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_latency_ms() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
resourceId: orders
provisionedThroughput: "1000"
settings:
  renewalIntervalMs: 500
groups:
  - groupName: interactive
    targetThroughput: 200
    isDefault: true
  - groupName: analytics
    targetThroughputThreshold: "0.3"
    suppressInitError: true
    global:
      renewIntervalMs: 5000
      clientIdPrefix: sim
workloads:
  - name: dashboard
    concurrency: 4
    requestCharge: 2.5
  - name: reports
    group: analytics
    requestCharge: "10"
    estimatedCharge: 10
    notFoundRatio: 0.1
"#;

    #[test]
    fn parses_sample_config() {
        let config = SimConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.resource_id, "orders");
        assert_eq!(config.provisioned_throughput, 1000.0);
        assert_eq!(config.settings.renewal_interval, Duration::from_millis(500));
        assert_eq!(config.groups.len(), 2);

        let interactive = &config.groups[0];
        assert_eq!(interactive.config.target_throughput, Some(200.0));
        assert!(interactive.config.is_default);
        assert!(interactive.global.is_none());

        let analytics = &config.groups[1];
        assert_eq!(analytics.config.target_throughput_threshold, Some(0.3));
        assert!(analytics.config.suppress_init_error);
        let global = analytics.global.as_ref().unwrap();
        assert_eq!(global.renew_interval, Duration::from_secs(5));
        assert_eq!(global.client_id_prefix, "sim");

        let reports = &config.workloads[1];
        assert_eq!(reports.group.as_deref(), Some("analytics"));
        assert_eq!(reports.request_charge, 10.0);
        assert_eq!(reports.estimated_charge, Some(10.0));
        assert_eq!(reports.not_found_ratio, Some(0.1));
        assert_eq!(config.workloads[0].concurrency, 4);
        assert_eq!(config.workloads[0].latency(), Duration::from_millis(5));
    }

    #[test]
    fn rejects_workload_for_unknown_group() {
        let yaml = r#"
provisionedThroughput: 100
workloads:
  - name: orphan
    group: nowhere
    requestCharge: 1
"#;
        let err = SimConfig::from_yaml(yaml).unwrap_err();
        assert_eq!(
            err.to_string(),
            "workload `orphan` refers to unknown group `nowhere`"
        );
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let yaml = r#"
provisionedThroughput: 100
workloads:
  - name: broken
    requestCharge: 1
    notFoundRatio: 1.5
"#;
        assert!(matches!(
            SimConfig::from_yaml(yaml),
            Err(ConfigError::InvalidWorkload { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = SimConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
