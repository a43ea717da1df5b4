use async_trait::async_trait;
use error_stack::Report;

use crate::ThroughputControlError;

/// Resolves the total provisioned throughput of the target resource.
///
/// Consulted when a group is configured with `target_throughput_threshold`.
#[async_trait]
pub trait ProvisionedThroughputSource: Send + Sync {
    async fn provisioned_throughput(
        &self,
        resource_id: &str,
    ) -> Result<f64, Report<ThroughputControlError>>;
}

/// A resource whose provisioned throughput never changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedProvisionedThroughput(pub f64);

#[async_trait]
impl ProvisionedThroughputSource for FixedProvisionedThroughput {
    async fn provisioned_throughput(
        &self,
        resource_id: &str,
    ) -> Result<f64, Report<ThroughputControlError>> {
        if self.0.is_finite() && self.0 > 0.0 {
            Ok(self.0)
        } else {
            Err(Report::new(
                ThroughputControlError::ProvisionedThroughputUnavailable {
                    resource_id: resource_id.to_string(),
                },
            )
            .attach_printable(format!("provisioned throughput is {}", self.0)))
        }
    }
}
