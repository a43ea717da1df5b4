//! In-process stand-in for the remote resource.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use throughput_control::{AtomicF64, ChargedResponse, RequestCharge};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The item does not exist. The lookup is still billed.
    #[error("item not found (charge {charge})")]
    NotFound { charge: f64 },
    /// The backend's own throttling.
    #[error("request rate is too large")]
    ServerThrottled,
}

impl RequestCharge for BackendError {
    fn request_charge(&self) -> Option<f64> {
        match self {
            Self::NotFound { charge } => Some(*charge),
            Self::ServerThrottled => None,
        }
    }
}

/// Serves every request after a fixed latency, billing a fixed charge.
///
/// Consumption beyond the provisioned throughput of the current second is
/// answered with [`BackendError::ServerThrottled`], so the simulation shows
/// whether client-side control kept the resource within budget.
#[derive(Debug)]
pub struct FakeBackend {
    provisioned_throughput: f64,
    epoch: tokio::time::Instant,
    window: AtomicU64,
    consumed: AtomicF64,
    served: AtomicU64,
}

impl FakeBackend {
    pub fn new(provisioned_throughput: f64) -> Self {
        Self {
            provisioned_throughput,
            epoch: tokio::time::Instant::now(),
            window: AtomicU64::new(0),
            consumed: AtomicF64::new(0.0),
            served: AtomicU64::new(0),
        }
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Executes one request.
    ///
    /// Every `not_found_every`-th request of this backend fails with a charged
    /// not-found error; `0` disables failures.
    pub async fn execute(
        &self,
        charge: f64,
        latency: Duration,
        not_found_every: u64,
    ) -> Result<ChargedResponse<u64>, BackendError> {
        tokio::time::sleep(latency).await;

        if !self.consume(charge) {
            return Err(BackendError::ServerThrottled);
        }

        let sequence = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        if not_found_every > 0 && sequence % not_found_every == 0 {
            return Err(BackendError::NotFound { charge });
        }
        Ok(ChargedResponse::new(sequence, charge))
    }

    /// Accounts `charge` against the current one-second window.
    fn consume(&self, charge: f64) -> bool {
        let window = self.epoch.elapsed().as_secs();
        if self.window.swap(window, Ordering::AcqRel) != window {
            self.consumed.store(0.0);
        }

        self.consumed
            .fetch_update(|consumed| {
                (consumed < self.provisioned_throughput).then_some(consumed + charge)
            })
            .is_ok()
    }
}

/// Converts a failure ratio into "fail every n-th request".
pub fn not_found_every(ratio: Option<f64>) -> u64 {
    match ratio {
        Some(ratio) if ratio > 0.0 => (1.0 / ratio).round().max(1.0) as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test(tokio::test(start_paused = true))]
    async fn not_found_is_charged() {
        let backend = FakeBackend::new(1_000.0);

        let first = backend.execute(3.0, Duration::ZERO, 2).await.unwrap();
        assert_eq!(first.request_charge(), Some(3.0));

        let err = backend.execute(3.0, Duration::ZERO, 2).await.unwrap_err();
        assert_eq!(err, BackendError::NotFound { charge: 3.0 });
        assert_eq!(err.request_charge(), Some(3.0));
        assert_eq!(backend.served(), 2);
    }

    #[test(tokio::test(start_paused = true))]
    async fn overload_is_throttled_by_server() {
        let backend = FakeBackend::new(10.0);
        backend.execute(8.0, Duration::ZERO, 0).await.unwrap();
        backend.execute(8.0, Duration::ZERO, 0).await.unwrap();

        let err = backend.execute(8.0, Duration::ZERO, 0).await.unwrap_err();
        assert_eq!(err, BackendError::ServerThrottled);
        assert_eq!(err.request_charge(), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.execute(8.0, Duration::ZERO, 0).await.is_ok());
    }

    #[test]
    fn ratio_conversion() {
        assert_eq!(not_found_every(None), 0);
        assert_eq!(not_found_every(Some(0.0)), 0);
        assert_eq!(not_found_every(Some(0.1)), 10);
        assert_eq!(not_found_every(Some(1.0)), 1);
    }
}
