use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use similar_asserts::assert_eq;
use test_log::test;
use throughput_control::{
    ControlGroupConfig, ControlRecordStore, ControllerSettings, FixedProvisionedThroughput,
    GlobalControlConfig, GlobalThroughputCoordinator, InMemoryControlStore,
    ThroughputControlError, ThroughputController,
};

const RENEW: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn global_config() -> GlobalControlConfig {
    GlobalControlConfig::new(RENEW)
}

fn controller(resource: &str) -> ThroughputController {
    ThroughputController::new(
        resource,
        ControllerSettings::default(),
        Arc::new(FixedProvisionedThroughput(1000.0)),
    )
    .unwrap()
}

fn analytics(total: f64) -> ControlGroupConfig {
    ControlGroupConfig::new("analytics")
        .with_target_throughput(total)
        .with_default(true)
}

#[test(tokio::test(start_paused = true))]
async fn two_instances_converge_on_half_each() {
    let store = Arc::new(InMemoryControlStore::new());
    let first = controller("orders");
    let second = controller("orders");

    first
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store.clone())
        .await
        .unwrap();
    assert_eq!(first.throttler("analytics").unwrap().scheduled_throughput(), 100.0);

    second
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store.clone())
        .await
        .unwrap();
    assert_eq!(second.throttler("analytics").unwrap().scheduled_throughput(), 50.0);

    // the first instance learns about its peer on its next reconciliation,
    // its throttler on the renewal after that
    tokio::time::sleep(RENEW + Duration::from_millis(1500)).await;
    let first_coordinator = first.coordinator("analytics").unwrap();
    assert_eq!(first_coordinator.current_share(), 50.0);
    assert_eq!(first_coordinator.active_instances(), 2);
    assert_eq!(first.throttler("analytics").unwrap().scheduled_throughput(), 50.0);
    assert_eq!(second.throttler("analytics").unwrap().scheduled_throughput(), 50.0);

    first.shutdown().await;
    second.shutdown().await;
}

#[test(tokio::test)]
async fn survivor_reclaims_expired_share() {
    let store: Arc<dyn ControlRecordStore> = Arc::new(InMemoryControlStore::new());
    let survivor =
        GlobalThroughputCoordinator::new("analytics", 100.0, global_config(), store.clone());
    let crashed =
        GlobalThroughputCoordinator::new("analytics", 100.0, global_config(), store.clone());

    let t0 = 1_000_000;
    survivor.reconcile_at(t0).await.unwrap();
    assert_eq!(crashed.reconcile_at(t0).await.unwrap(), 50.0);
    assert_eq!(survivor.reconcile_at(t0 + 1).await.unwrap(), 50.0);

    // `crashed` stops heartbeating after t0
    let expire = global_config().effective_expire_interval();
    let bound = expire.as_millis().div_ceil(RENEW.as_millis()) as u64 + 1;
    let renew_ms = RENEW.as_millis() as u64;

    let mut rounds = 0;
    let mut share = survivor.current_share();
    while share < 100.0 {
        rounds += 1;
        assert!(rounds <= bound, "share not reclaimed after {rounds} rounds");
        share = survivor.reconcile_at(t0 + rounds * renew_ms).await.unwrap();
    }
    assert_eq!(share, 100.0);
    assert_eq!(survivor.active_instances(), 1);
}

#[test(tokio::test)]
async fn store_outage_reuses_last_share() {
    let store = Arc::new(InMemoryControlStore::new());
    let first = GlobalThroughputCoordinator::new("analytics", 90.0, global_config(), store.clone());
    let second =
        GlobalThroughputCoordinator::new("analytics", 90.0, global_config(), store.clone());
    let third = GlobalThroughputCoordinator::new("analytics", 90.0, global_config(), store.clone());

    let t0 = now_ms();
    first.reconcile_at(t0).await.unwrap();
    second.reconcile_at(t0).await.unwrap();
    assert_eq!(third.reconcile_at(t0).await.unwrap(), 30.0);

    store.set_available(false);
    let report = third.reconcile_at(t0 + 5_000).await.unwrap_err();
    assert!(matches!(
        report.current_context(),
        ThroughputControlError::ControlStoreUnavailable { .. }
    ));
    assert_eq!(third.current_share(), 30.0);
    assert!(!third.is_halted());

    store.set_available(true);
    assert_eq!(third.reconcile_at(t0 + 6_000).await.unwrap(), 30.0);
}

#[test(tokio::test(start_paused = true))]
async fn running_coordinator_survives_outage() {
    let store = Arc::new(InMemoryControlStore::new());
    let controller = controller("orders");
    controller
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store.clone())
        .await
        .unwrap();
    let coordinator = controller.coordinator("analytics").unwrap();

    store.set_available(false);
    let round_trips = store.round_trips();
    tokio::time::sleep(RENEW * 2 + Duration::from_millis(500)).await;

    assert!(store.round_trips() > round_trips);
    assert_eq!(coordinator.current_share(), 100.0);
    assert!(!coordinator.is_halted());
    assert_eq!(controller.throttler("analytics").unwrap().scheduled_throughput(), 100.0);
}

#[test(tokio::test(start_paused = true))]
async fn first_outage_with_suppression_uses_full_total() {
    let store = Arc::new(InMemoryControlStore::new());
    store.set_available(false);
    let controller = controller("orders");

    controller
        .enable_global_throughput_control_group(
            analytics(100.0).with_suppress_init_error(true),
            global_config(),
            store.clone(),
        )
        .await
        .unwrap();
    assert_eq!(controller.throttler("analytics").unwrap().scheduled_throughput(), 100.0);

    // a later successful round takes over
    store.set_available(true);
    tokio::time::sleep(RENEW + Duration::from_millis(500)).await;
    let coordinator = controller.coordinator("analytics").unwrap();
    assert_eq!(coordinator.active_instances(), 1);
}

#[test(tokio::test(start_paused = true))]
async fn first_outage_without_suppression_fails() {
    let store = Arc::new(InMemoryControlStore::new());
    store.set_available(false);
    let controller = controller("orders");

    let report = controller
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store)
        .await
        .unwrap_err();
    assert_eq!(
        report.current_context(),
        &ThroughputControlError::InitializationFailed {
            group_name: "analytics".to_string()
        }
    );
    assert!(controller.throttler("analytics").is_none());
}

#[test(tokio::test(start_paused = true))]
async fn schema_mismatch_fails_setup() {
    let store = Arc::new(InMemoryControlStore::new());
    store.put_raw(
        "analytics",
        r#"{"schemaVersion":7,"groupName":"analytics","totalThroughput":10.0}"#,
    );
    let controller = controller("orders");

    let report = controller
        .enable_global_throughput_control_group(
            analytics(100.0).with_suppress_init_error(true),
            global_config(),
            store,
        )
        .await
        .unwrap_err();
    assert_eq!(
        report.current_context(),
        &ThroughputControlError::SchemaMismatch {
            found: 7,
            expected: 1
        }
    );
    assert!(controller.throttler("analytics").is_none());
}

#[test(tokio::test(start_paused = true))]
async fn record_with_unknown_layout_fails_setup_despite_suppression() {
    let store = Arc::new(InMemoryControlStore::new());
    store.put_raw(
        "analytics",
        r#"{"schemaVersion":2,"groupName":"analytics","capacity":{"ru":50.0}}"#,
    );
    let controller = controller("orders");

    let report = controller
        .enable_global_throughput_control_group(
            analytics(100.0).with_suppress_init_error(true),
            global_config(),
            store,
        )
        .await
        .unwrap_err();
    assert_eq!(
        report.current_context(),
        &ThroughputControlError::SchemaMismatch {
            found: 2,
            expected: 1
        }
    );
    assert!(controller.throttler("analytics").is_none());
}

#[test(tokio::test(start_paused = true))]
async fn renew_interval_below_floor_is_rejected() {
    let store = Arc::new(InMemoryControlStore::new());
    let controller = controller("orders");

    let report = controller
        .enable_global_throughput_control_group(
            analytics(100.0),
            GlobalControlConfig::new(Duration::from_secs(1)),
            store.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        report.current_context(),
        ThroughputControlError::InvalidConfiguration { .. }
    ));
    assert_eq!(controller.group_count(), 0);
    assert_eq!(store.round_trips(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn shutdown_releases_lease() {
    let store = Arc::new(InMemoryControlStore::new());
    let leaving = controller("orders");
    let staying = controller("orders");
    leaving
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store.clone())
        .await
        .unwrap();
    staying
        .enable_global_throughput_control_group(analytics(100.0), global_config(), store.clone())
        .await
        .unwrap();

    let leaving_id = leaving.coordinator("analytics").unwrap().client_id().to_string();
    leaving.shutdown().await;

    let record = store.load("analytics").await.unwrap().unwrap();
    assert!(!record.leases.contains_key(&leaving_id));
    assert_eq!(record.live_instances(), 1);

    // the peer regains the full budget on its next round
    tokio::time::sleep(RENEW + Duration::from_millis(500)).await;
    assert_eq!(staying.coordinator("analytics").unwrap().current_share(), 100.0);
}
