use std::time::Duration;

use error_stack::Report;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ThroughputControlError;

/// Smallest allowed reconciliation interval for globally controlled groups.
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_CLIENT_ID_PREFIX: &str = "throughput-client";

/// Configuration of one throughput control group.
///
/// Exactly one of `target_throughput` and `target_throughput_threshold` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlGroupConfig {
    pub group_name: String,
    /// Absolute budget in cost units per renewal cycle.
    #[serde(default, deserialize_with = "deserialize_optional_f64_from_string")]
    pub target_throughput: Option<f64>,
    /// Fraction of the resource's provisioned throughput, in (0, 1].
    #[serde(default, deserialize_with = "deserialize_optional_f64_from_string")]
    pub target_throughput_threshold: Option<f64>,
    #[serde(default)]
    pub is_default: bool,
    /// Keep serving (unregulated or through the default group) when the group
    /// cannot be initialized.
    #[serde(default)]
    pub suppress_init_error: bool,
}

/// Resolved form of a group's target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThroughputTarget {
    Absolute(f64),
    Threshold(f64),
}

impl ThroughputTarget {
    pub fn is_threshold(&self) -> bool {
        matches!(self, Self::Threshold(_))
    }

    /// Budget per cycle given the resource's provisioned throughput.
    pub fn resolve(&self, provisioned_throughput: f64) -> f64 {
        match *self {
            Self::Absolute(target) => target,
            Self::Threshold(fraction) => fraction * provisioned_throughput,
        }
    }
}

impl ControlGroupConfig {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            target_throughput: None,
            target_throughput_threshold: None,
            is_default: false,
            suppress_init_error: false,
        }
    }

    pub fn with_target_throughput(mut self, target_throughput: f64) -> Self {
        self.target_throughput = Some(target_throughput);
        self
    }

    pub fn with_target_throughput_threshold(mut self, threshold: f64) -> Self {
        self.target_throughput_threshold = Some(threshold);
        self
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_suppress_init_error(mut self, suppress_init_error: bool) -> Self {
        self.suppress_init_error = suppress_init_error;
        self
    }

    /// Validates the config and returns its target.
    pub fn target(&self) -> Result<ThroughputTarget, Report<ThroughputControlError>> {
        if self.group_name.trim().is_empty() {
            return Err(Report::new(ThroughputControlError::invalid_config(
                "group name must not be empty",
            )));
        }

        let target = match (self.target_throughput, self.target_throughput_threshold) {
            (Some(_), Some(_)) => {
                return Err(Report::new(ThroughputControlError::invalid_config(
                    "only one of target throughput and target throughput threshold may be set",
                ))
                .attach_printable(format!("group: {}", self.group_name)));
            }
            (None, None) => {
                return Err(Report::new(ThroughputControlError::invalid_config(
                    "one of target throughput and target throughput threshold must be set",
                ))
                .attach_printable(format!("group: {}", self.group_name)));
            }
            (Some(target), None) => {
                if !target.is_finite() || target <= 0.0 {
                    return Err(Report::new(ThroughputControlError::invalid_config(
                        format!("target throughput must be positive, got {target}"),
                    ))
                    .attach_printable(format!("group: {}", self.group_name)));
                }
                ThroughputTarget::Absolute(target)
            }
            (None, Some(threshold)) => {
                if !(threshold > 0.0 && threshold <= 1.0) {
                    return Err(Report::new(ThroughputControlError::invalid_config(
                        format!("target throughput threshold must be in (0, 1], got {threshold}"),
                    ))
                    .attach_printable(format!("group: {}", self.group_name)));
                }
                ThroughputTarget::Threshold(threshold)
            }
        };

        Ok(target)
    }
}

/// Settings for a globally controlled group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalControlConfig {
    /// How often the shared control record is reconciled.
    #[serde(rename = "renewIntervalMs", with = "duration_millis")]
    pub renew_interval: Duration,
    /// Lease lifetime of a client entry; defaults to `2 * renew_interval + 1s`.
    #[serde(rename = "expireIntervalMs", with = "optional_duration_millis")]
    pub expire_interval: Option<Duration>,
    pub client_id_prefix: String,
}

impl Default for GlobalControlConfig {
    fn default() -> Self {
        Self {
            renew_interval: DEFAULT_RENEW_INTERVAL,
            expire_interval: None,
            client_id_prefix: DEFAULT_CLIENT_ID_PREFIX.to_string(),
        }
    }
}

impl GlobalControlConfig {
    pub fn new(renew_interval: Duration) -> Self {
        Self {
            renew_interval,
            ..Default::default()
        }
    }

    pub fn with_expire_interval(mut self, expire_interval: Duration) -> Self {
        self.expire_interval = Some(expire_interval);
        self
    }

    pub fn with_client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = prefix.into();
        self
    }

    /// Shortest lease that survives one missed reconciliation.
    fn min_expire_interval(&self) -> Duration {
        self.renew_interval * 2 + Duration::from_secs(1)
    }

    pub fn effective_expire_interval(&self) -> Duration {
        self.expire_interval
            .unwrap_or_else(|| self.min_expire_interval())
    }

    pub fn validate(&self) -> Result<(), Report<ThroughputControlError>> {
        if self.renew_interval < MIN_RENEW_INTERVAL {
            return Err(Report::new(ThroughputControlError::invalid_config(format!(
                "renew interval must be at least {MIN_RENEW_INTERVAL:?}, got {:?}",
                self.renew_interval
            ))));
        }
        if let Some(expire) = self.expire_interval {
            let min_expire = self.min_expire_interval();
            if expire < min_expire {
                return Err(Report::new(ThroughputControlError::invalid_config(format!(
                    "expire interval must be at least {min_expire:?}, got {expire:?}"
                ))));
            }
        }
        if self.client_id_prefix.trim().is_empty() {
            return Err(Report::new(ThroughputControlError::invalid_config(
                "client id prefix must not be empty",
            )));
        }
        Ok(())
    }
}

/// Settings shared by every group of one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerSettings {
    /// Length of one renewal cycle.
    #[serde(rename = "renewalIntervalMs", with = "duration_millis")]
    pub renewal_interval: Duration,
    /// How often threshold-based targets are re-resolved.
    #[serde(rename = "provisionedRefreshIntervalMs", with = "duration_millis")]
    pub provisioned_refresh_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(1),
            provisioned_refresh_interval: Duration::from_secs(60),
        }
    }
}

impl ControllerSettings {
    pub fn with_renewal_interval(mut self, renewal_interval: Duration) -> Self {
        self.renewal_interval = renewal_interval;
        self
    }

    pub fn with_provisioned_refresh_interval(mut self, interval: Duration) -> Self {
        self.provisioned_refresh_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), Report<ThroughputControlError>> {
        if self.renewal_interval.is_zero() {
            return Err(Report::new(ThroughputControlError::invalid_config(
                "renewal interval must be positive",
            )));
        }
        if self.provisioned_refresh_interval.is_zero() {
            return Err(Report::new(ThroughputControlError::invalid_config(
                "provisioned refresh interval must be positive",
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrFloat {
    String(String),
    Float(f64),
}

impl StringOrFloat {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            Self::String(s) => s.trim().parse::<f64>().map_err(|e| {
                E::custom(format!("Failed to parse float from string '{s}': {e}"))
            }),
            Self::Float(f) => Ok(f),
        }
    }
}

/// Accepts numbers and numeric strings, as emitted by some config generators.
pub fn deserialize_f64_from_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrFloat::deserialize(deserializer)?.into_f64()
}

/// Optional variant of [`deserialize_f64_from_string`]; `null` is `None`.
pub fn deserialize_optional_f64_from_string<'de, D>(
    deserializer: D,
) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<StringOrFloat>::deserialize(deserializer)?
        .map(StringOrFloat::into_f64)
        .transpose()
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::StringOrFloat;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = StringOrFloat::deserialize(deserializer)?.into_f64::<D::Error>()?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of milliseconds, got {millis}"
            )));
        }
        Ok(Duration::from_millis(millis as u64))
    }
}

mod optional_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
