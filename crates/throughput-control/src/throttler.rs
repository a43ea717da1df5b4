//! Local admission control with deferred cost accounting.

use core::future::Future;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::atomic::AtomicF64;
use crate::charge::sanitize_charge;
use crate::{
    LinkedCancellationToken, RequestCharge, RequestDescriptor, RequestError, ThrottledError,
};

const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// Counters for the current renewal cycle. Reset on every renewal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleStats {
    pub admitted: u64,
    pub rejected: u64,
    pub cancelled: u64,
    /// Sum of the charges billed to this group during the cycle.
    pub charged: f64,
}

#[derive(Debug)]
struct CycleCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    charged: AtomicF64,
}

impl CycleCounters {
    fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            charged: AtomicF64::new(0.0),
        }
    }

    fn snapshot(&self) -> CycleStats {
        CycleStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            charged: self.charged.load(),
        }
    }

    fn take(&self) -> CycleStats {
        CycleStats {
            admitted: self.admitted.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            cancelled: self.cancelled.swap(0, Ordering::Relaxed),
            charged: self.charged.swap(0.0),
        }
    }
}

/// Budget of one group.
///
/// `settled` is the throughput left after every completed request has been
/// billed; `reserved` is the sum of estimated charges of requests still in
/// flight. Renewal caps `settled` only, so a pending reservation never hides
/// the charge billed after it.
#[derive(Debug, Clone, Copy)]
struct Balance {
    scheduled: f64,
    settled: f64,
    reserved: f64,
}

impl Balance {
    fn available(&self) -> f64 {
        self.settled - self.reserved
    }
}

/// Estimated charge held by an admitted request until its outcome is known.
///
/// Released without a charge when dropped, e.g. when the caller abandons the
/// request future.
struct Reservation<'a> {
    throttler: &'a RequestThrottler,
    amount: Option<f64>,
}

impl Reservation<'_> {
    fn settle(mut self, charge: Option<f64>) {
        if let Some(amount) = self.amount.take() {
            self.throttler.settle(amount, charge);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(amount) = self.amount.take() {
            self.throttler.settle(amount, None);
        }
    }
}

/// Token-bucket-like admission control for one control group.
///
/// A request is admitted while the available throughput is strictly positive,
/// whatever it is going to cost. The billed charge is deducted once the request
/// completes, so the available throughput can go negative; that debt is repaid
/// by later renewals.
///
/// The balance is only ever modified under a short lock that performs no I/O,
/// and the request's own operation always runs outside of it.
#[derive(Debug)]
pub struct RequestThrottler {
    group_name: String,
    balance: Mutex<Balance>,
    renewal_interval: Duration,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last renewal.
    last_renewal: AtomicU64,
    counters: CycleCounters,
}

impl RequestThrottler {
    /// Creates a throttler whose first cycle starts with the full scheduled budget.
    pub fn new(
        group_name: impl Into<String>,
        scheduled_throughput: f64,
        renewal_interval: Duration,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            balance: Mutex::new(Balance {
                scheduled: scheduled_throughput,
                settled: scheduled_throughput,
                reserved: 0.0,
            }),
            renewal_interval,
            epoch: Instant::now(),
            last_renewal: AtomicU64::new(0),
            counters: CycleCounters::new(),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn scheduled_throughput(&self) -> f64 {
        self.balance().scheduled
    }

    /// Budget left for admission: the settled balance minus in-flight reservations.
    pub fn available_throughput(&self) -> f64 {
        self.balance().available()
    }

    pub fn renewal_interval(&self) -> Duration {
        self.renewal_interval
    }

    /// Counters accumulated since the last renewal.
    pub fn cycle_stats(&self) -> CycleStats {
        self.counters.snapshot()
    }

    /// Runs `operation` if the group has budget left, then charges its cost.
    ///
    /// The operation is never called for a rejected or already-cancelled request.
    /// Its error is returned unchanged as [`RequestError::Executor`]; when the
    /// error still carries a charge, that charge is deducted as well.
    ///
    /// If `cancel` fires before the operation completes, the operation is
    /// dropped, nothing is charged and [`RequestError::Cancelled`] is returned.
    pub async fn process_request<F, Fut, T, E>(
        &self,
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
        if cancel.is_some_and(LinkedCancellationToken::is_cancellation_requested) {
            tracing::debug!(
                group_name = %self.group_name,
                operation = %descriptor.operation,
                "Request cancelled before admission"
            );
            return Err(RequestError::Cancelled);
        }

        let reservation = self
            .try_admit(descriptor, descriptor.reservation())
            .map_err(RequestError::Throttled)?;

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    outcome = operation() => Some(outcome),
                }
            }
            None => Some(operation().await),
        };

        match outcome {
            None => {
                reservation.settle(None);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    group_name = %self.group_name,
                    operation = %descriptor.operation,
                    "Request cancelled in flight, reservation released"
                );
                Err(RequestError::Cancelled)
            }
            Some(Ok(response)) => {
                reservation.settle(response.request_charge());
                Ok(response)
            }
            Some(Err(err)) => {
                reservation.settle(err.request_charge());
                Err(RequestError::Executor(err))
            }
        }
    }

    /// Starts a new cycle: `S := S'`, `A := min(A + S', S')`.
    ///
    /// Debt from previous cycles is carried over, only surplus is capped. The
    /// cap applies to the settled balance; reservations of in-flight requests
    /// are subtracted again afterwards. `S` and `A` change together.
    /// Returns the counters of the cycle that just ended.
    pub fn renew_cycle(&self, scheduled_throughput: f64) -> CycleStats {
        let (previous, available) = {
            let mut balance = self.lock_balance();
            let previous = balance.available();
            balance.scheduled = scheduled_throughput;
            balance.settled = (balance.settled + scheduled_throughput).min(scheduled_throughput);
            (previous, balance.available())
        };
        self.last_renewal
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Release);
        let stats = self.counters.take();

        tracing::debug!(
            group_name = %self.group_name,
            scheduled = scheduled_throughput,
            available_before = previous,
            available = available,
            admitted = stats.admitted,
            rejected = stats.rejected,
            charged = stats.charged,
            "Renewed throughput cycle"
        );

        stats
    }

    /// Admits iff `A > 0`, reserving `reserved` under the same lock.
    fn try_admit(
        &self,
        descriptor: &RequestDescriptor,
        reserved: f64,
    ) -> Result<Reservation<'_>, ThrottledError> {
        let admission = {
            let mut balance = self.lock_balance();
            let available = balance.available();
            if available > 0.0 {
                balance.reserved += reserved;
                Ok(available)
            } else {
                Err(available)
            }
        };

        match admission {
            Ok(before) => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    group_name = %self.group_name,
                    operation = %descriptor.operation,
                    available = before,
                    reserved = reserved,
                    "Request admitted"
                );
                Ok(Reservation {
                    throttler: self,
                    amount: Some(reserved),
                })
            }
            Err(available) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let retry_after = self.retry_after();
                tracing::debug!(
                    group_name = %self.group_name,
                    operation = %descriptor.operation,
                    available = available,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rejected: throughput budget exhausted"
                );
                Err(ThrottledError::new(
                    self.group_name.clone(),
                    retry_after,
                    available,
                    (reserved > 0.0).then_some(reserved),
                ))
            }
        }
    }

    /// Trues up a reservation against the billed charge.
    fn settle(&self, reserved: f64, charge: Option<f64>) {
        let charge = charge.and_then(sanitize_charge);
        if let Some(charge) = charge {
            self.counters.charged.fetch_add(charge);
        }
        let mut balance = self.lock_balance();
        balance.reserved -= reserved;
        balance.settled -= charge.unwrap_or(0.0);
    }

    fn lock_balance(&self) -> std::sync::MutexGuard<'_, Balance> {
        self.balance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn balance(&self) -> Balance {
        *self.lock_balance()
    }

    /// Time left until the next renewal is due.
    fn retry_after(&self) -> Duration {
        let last_renewal = Duration::from_nanos(self.last_renewal.load(Ordering::Acquire));
        let since_renewal = self.epoch.elapsed().saturating_sub(last_renewal);
        self.renewal_interval
            .saturating_sub(since_renewal)
            .max(MIN_RETRY_AFTER)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::{ChargedResponse, LinkedCancellationTokenSource};

    #[derive(Debug, PartialEq)]
    enum BackendError {
        NotFound { charge: f64 },
        Timeout,
    }

    impl RequestCharge for BackendError {
        fn request_charge(&self) -> Option<f64> {
            match self {
                Self::NotFound { charge } => Some(*charge),
                Self::Timeout => None,
            }
        }
    }

    fn throttler(scheduled: f64) -> RequestThrottler {
        RequestThrottler::new("test-group", scheduled, Duration::from_secs(1))
    }

    async fn charged(
        throttler: &RequestThrottler,
        charge: f64,
    ) -> Result<ChargedResponse<&'static str>, RequestError<BackendError>> {
        throttler
            .process_request(&RequestDescriptor::new("read"), None, || async move {
                Ok(ChargedResponse::new("doc", charge))
            })
            .await
    }

    #[test(tokio::test)]
    async fn observed_charge_sequence() {
        let throttler = throttler(1.0);

        // admitted with A = 1.0, charged 2.0
        let response = charged(&throttler, 2.0).await.expect("first request admitted");
        assert_eq!(response.value, "doc");
        assert_eq!(throttler.available_throughput(), -1.0);

        // A = -1.0 is not > 0
        let err = charged(&throttler, 2.0).await.expect_err("second request rejected");
        assert!(err.is_throttled());
        assert_eq!(throttler.available_throughput(), -1.0);

        throttler.renew_cycle(1.0);
        assert_eq!(throttler.available_throughput(), 0.0);

        // A = 0.0 is not > 0 either
        assert!(charged(&throttler, 2.0).await.unwrap_err().is_throttled());
        assert_eq!(throttler.available_throughput(), 0.0);

        throttler.renew_cycle(1.0);
        assert_eq!(throttler.available_throughput(), 1.0);

        // a not-found failure is still billed
        let err = throttler
            .process_request(&RequestDescriptor::new("read"), None, || async {
                Err::<ChargedResponse<()>, _>(BackendError::NotFound { charge: 2.0 })
            })
            .await
            .expect_err("not found is propagated");
        assert_eq!(
            err.into_executor(),
            Some(BackendError::NotFound { charge: 2.0 })
        );
        assert_eq!(throttler.available_throughput(), -1.0);
    }

    #[test(tokio::test)]
    async fn rejected_request_never_invokes_operation() {
        let throttler = throttler(0.0);
        let invoked = AtomicUsize::new(0);

        let err = throttler
            .process_request(&RequestDescriptor::new("write"), None, || {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BackendError>(()) }
            })
            .await
            .expect_err("empty budget rejects");

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let throttled = err.throttled().expect("throttled error");
        assert!(throttled.is_client_side());
        assert_eq!(throttled.group_name, "test-group");
        assert!(throttled.retry_after > Duration::ZERO);
        assert!(throttled.retry_after <= Duration::from_secs(1));
        assert_eq!(throttler.cycle_stats().rejected, 1);
    }

    #[test(tokio::test)]
    async fn admission_ignores_request_cost() {
        let throttler = throttler(0.5);
        charged(&throttler, 100.0).await.expect("any cost is admitted while A > 0");
        assert_eq!(throttler.available_throughput(), -99.5);
    }

    #[test(tokio::test)]
    async fn failure_without_charge_leaves_budget_untouched() {
        let throttler = throttler(10.0);
        let err = throttler
            .process_request(
                &RequestDescriptor::new("read").with_estimated_charge(3.0),
                None,
                || async { Err::<(), _>(BackendError::Timeout) },
            )
            .await
            .expect_err("timeout propagated");
        assert!(matches!(err, RequestError::Executor(BackendError::Timeout)));
        assert_eq!(throttler.available_throughput(), 10.0);
    }

    #[test(tokio::test)]
    async fn reservation_is_trued_up_to_actual_charge() {
        let throttler = throttler(10.0);
        throttler
            .process_request(
                &RequestDescriptor::new("query").with_estimated_charge(4.0),
                None,
                || async { Ok::<_, BackendError>(ChargedResponse::new((), 1.5)) },
            )
            .await
            .unwrap();
        assert_eq!(throttler.available_throughput(), 8.5);

        let stats = throttler.cycle_stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.charged, 1.5);
    }

    #[test]
    fn renewal_caps_surplus_and_keeps_debt() {
        let throttler = throttler(5.0);
        throttler.renew_cycle(5.0);
        assert_eq!(throttler.available_throughput(), 5.0);

        throttler.lock_balance().settled = 2.0;
        throttler.renew_cycle(10.0);
        assert_eq!(throttler.available_throughput(), 10.0);
        assert_eq!(throttler.scheduled_throughput(), 10.0);

        throttler.lock_balance().settled = -25.0;
        throttler.renew_cycle(10.0);
        assert_eq!(throttler.available_throughput(), -15.0);

        throttler.lock_balance().settled = 7.0;
        throttler.renew_cycle(3.0);
        assert_eq!(throttler.available_throughput(), 3.0);
    }

    #[test]
    fn renewal_resets_cycle_stats() {
        let throttler = throttler(0.0);
        let _ = throttler.try_admit(&RequestDescriptor::new("read"), 0.0);
        assert_eq!(throttler.cycle_stats().rejected, 1);

        let ended = throttler.renew_cycle(1.0);
        assert_eq!(ended.rejected, 1);
        assert_eq!(throttler.cycle_stats(), CycleStats::default());
    }

    /// Starts a request reserving `estimated` whose outcome is sent through the returned channel.
    async fn pending_request(
        throttler: &Arc<RequestThrottler>,
        estimated: f64,
        token: Option<LinkedCancellationToken>,
    ) -> (
        tokio::sync::oneshot::Sender<Result<ChargedResponse<()>, BackendError>>,
        tokio::task::JoinHandle<Result<ChargedResponse<()>, RequestError<BackendError>>>,
    ) {
        let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let throttler = throttler.clone();
        let request = tokio::spawn(async move {
            throttler
                .process_request(
                    &RequestDescriptor::new("query").with_estimated_charge(estimated),
                    token.as_ref(),
                    || async move {
                        let _ = started_tx.send(());
                        outcome_rx.await.unwrap_or(Err(BackendError::Timeout))
                    },
                )
                .await
        });
        started_rx.await.expect("operation started");
        (outcome_tx, request)
    }

    #[test(tokio::test)]
    async fn charge_after_renewal_is_not_absorbed_by_cap() {
        let throttler = Arc::new(throttler(10.0));
        let (outcome, request) = pending_request(&throttler, 4.0, None).await;
        assert_eq!(throttler.available_throughput(), 6.0);

        throttler.renew_cycle(10.0);
        assert_eq!(throttler.available_throughput(), 6.0);

        outcome.send(Ok(ChargedResponse::new((), 4.0))).unwrap();
        request.await.unwrap().expect("completed");
        // min(10 + 10, 10) - 4
        assert_eq!(throttler.available_throughput(), 6.0);

        throttler.renew_cycle(10.0);
        assert_eq!(throttler.available_throughput(), 10.0);
    }

    #[test(tokio::test)]
    async fn higher_charge_after_renewal_leaves_debt() {
        let throttler = Arc::new(throttler(10.0));
        let (outcome, request) = pending_request(&throttler, 2.0, None).await;

        throttler.renew_cycle(10.0);
        outcome.send(Ok(ChargedResponse::new((), 25.0))).unwrap();
        request.await.unwrap().expect("completed");

        assert_eq!(throttler.available_throughput(), -15.0);
        throttler.renew_cycle(10.0);
        assert_eq!(throttler.available_throughput(), -5.0);
    }

    #[test(tokio::test)]
    async fn refund_after_renewal_never_exceeds_schedule() {
        let throttler = Arc::new(throttler(10.0));
        let source = LinkedCancellationTokenSource::new();
        let (_outcome, request) = pending_request(&throttler, 4.0, Some(source.token())).await;

        throttler.renew_cycle(10.0);
        source.close();
        assert!(request.await.unwrap().unwrap_err().is_cancelled());

        assert_eq!(throttler.available_throughput(), 10.0);
        assert_eq!(throttler.scheduled_throughput(), 10.0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn abandoned_request_releases_reservation() {
        let throttler = throttler(10.0);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            throttler.process_request(
                &RequestDescriptor::new("query").with_estimated_charge(4.0),
                None,
                || std::future::pending::<Result<ChargedResponse<()>, BackendError>>(),
            ),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(throttler.available_throughput(), 10.0);
        assert_eq!(throttler.cycle_stats().charged, 0.0);
    }

    #[test(tokio::test)]
    async fn cancelled_before_admission_is_free() {
        let throttler = throttler(5.0);
        let source = LinkedCancellationTokenSource::new();
        source.close();
        let token = source.token();

        let invoked = AtomicUsize::new(0);
        let err = throttler
            .process_request(
                &RequestDescriptor::new("read").with_estimated_charge(2.0),
                Some(&token),
                || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, BackendError>(ChargedResponse::new((), 2.0)) }
                },
            )
            .await
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(throttler.available_throughput(), 5.0);
        assert_eq!(throttler.cycle_stats().admitted, 0);
    }

    #[test(tokio::test)]
    async fn cancelled_in_flight_releases_reservation() {
        let throttler = Arc::new(throttler(5.0));
        let source = LinkedCancellationTokenSource::new();
        let token = source.token();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let request = {
            let throttler = throttler.clone();
            tokio::spawn(async move {
                throttler
                    .process_request(
                        &RequestDescriptor::new("read").with_estimated_charge(2.0),
                        Some(&token),
                        || async move {
                            let _ = started_tx.send(());
                            std::future::pending::<Result<ChargedResponse<()>, BackendError>>()
                                .await
                        },
                    )
                    .await
            })
        };

        started_rx.await.expect("operation started");
        assert_eq!(throttler.available_throughput(), 3.0);

        source.close();
        let err = request.await.expect("task joined").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(throttler.available_throughput(), 5.0);
        assert_eq!(throttler.cycle_stats().cancelled, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
    async fn concurrent_admissions_never_double_spend() {
        const REQUESTS: usize = 64;
        const BUDGETED: usize = 20;
        const COST: f64 = 2.0;

        for _ in 0..25 {
            let throttler = Arc::new(throttler(BUDGETED as f64 * COST));
            let barrier = Arc::new(tokio::sync::Barrier::new(REQUESTS));
            let invoked = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..REQUESTS)
                .map(|_| {
                    let throttler = throttler.clone();
                    let barrier = barrier.clone();
                    let invoked = invoked.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        throttler
                            .process_request(
                                &RequestDescriptor::new("write").with_estimated_charge(COST),
                                None,
                                || async move {
                                    invoked.fetch_add(1, Ordering::SeqCst);
                                    tokio::task::yield_now().await;
                                    Ok::<_, BackendError>(ChargedResponse::new((), COST))
                                },
                            )
                            .await
                    })
                })
                .collect();

            let mut admitted = 0;
            let mut rejected = 0;
            for handle in handles {
                match handle.await.expect("task joined") {
                    Ok(_) => admitted += 1,
                    Err(err) if err.is_throttled() => rejected += 1,
                    Err(err) => panic!("unexpected error: {err:?}"),
                }
            }

            assert_eq!(admitted, BUDGETED);
            assert_eq!(rejected, REQUESTS - BUDGETED);
            assert_eq!(invoked.load(Ordering::SeqCst), BUDGETED);
            assert_eq!(throttler.available_throughput(), 0.0);
        }
    }
}
