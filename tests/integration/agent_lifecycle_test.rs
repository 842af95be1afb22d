// tests/integration/agent_lifecycle_test.rs

//! Lifecycle scenarios: election, actuation, live reconfiguration, session
//! expiry, and graceful shutdown.

use crate::integration::test_helpers::{
    FakeMgr, LogCapture, MemoryCoordinator, wait_until,
};
use lustra_agent::core::agent::AgentDriver;
use lustra_agent::core::agent::runtime::{RuntimeConfig, RuntimeConfigWatcher, RuntimeSlot};
use lustra_agent::core::agent::service::ServiceCharge;
use lustra_agent::core::coordinator::Coordinator;
use lustra_agent::core::mgr::MgrCommand;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

const SERVICE: &str = "lustre0-OST000a";
const LOCK_KEY: &str = "lustra/services/lustre0-OST000a/lock";
const CONFIG_KEY: &str = "lustra/services/lustre0-OST000a/config";

fn service_driver(
    mock: &MemoryCoordinator,
    mgr: &FakeMgr,
    slot: Arc<RuntimeSlot>,
) -> AgentDriver<ServiceCharge> {
    let coordinator: Arc<dyn Coordinator> = Arc::new(mock.clone());
    AgentDriver::new(
        ServiceCharge::new(SERVICE),
        coordinator,
        MgrCommand::new(mgr.program()),
        slot,
    )
}

#[tokio::test]
async fn test_leader_mounts_when_autostart_enabled() {
    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::succeeding();
    let slot = RuntimeSlot::new();
    slot.publish(RuntimeConfig { autostart: true });

    let driver = service_driver(&mock, &mgr, slot);
    let agent_id = driver.agent_id().to_string();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    assert!(wait_until(Duration::from_secs(5), || mgr.invocation_count() >= 1).await);
    assert_eq!(mgr.invocations()[0], format!("service mount {SERVICE}"));

    let (value, session) = mock.holder(LOCK_KEY).expect("lock key should exist");
    assert_eq!(value, agent_id);
    assert!(session.is_some(), "lock should be session-bound");

    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("driver should stop after shutdown")
        .unwrap();
    assert!(!mock.is_locked(LOCK_KEY), "shutdown must release the lock");
}

#[tokio::test]
async fn test_failed_mount_is_retried_on_next_tick() {
    let mock = MemoryCoordinator::new();
    // Fails the first invocation with stderr, then succeeds.
    let mgr = FakeMgr::new(
        r#"if [ -e "$FLAG" ]; then
  exit 0
else
  touch "$FLAG"
  echo "link down" >&2
  exit 1
fi"#,
    );
    let slot = RuntimeSlot::new();
    slot.publish(RuntimeConfig { autostart: true });

    let driver = service_driver(&mock, &mgr, slot);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    // First tick fails, the retry lands one session TTL later.
    assert!(wait_until(Duration::from_secs(25), || mgr.invocation_count() >= 2).await);
    assert!(
        mock.is_locked(LOCK_KEY),
        "a failed mount must not cost the leadership"
    );

    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_autostart_disable_stops_actuation_within_one_tick() {
    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::succeeding();
    let slot = RuntimeSlot::new();
    mock.put(CONFIG_KEY, b"autostart: true");

    let coordinator: Arc<dyn Coordinator> = Arc::new(mock.clone());
    let watcher = RuntimeConfigWatcher::new(coordinator, CONFIG_KEY.to_string(), slot.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    let watcher_handle = tokio::spawn(watcher.run(shutdown_tx.subscribe()));

    let driver = service_driver(&mock, &mgr, slot.clone());
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    // The first tick may race the watcher's initial read; the second tick
    // lands one session TTL later.
    assert!(wait_until(Duration::from_secs(15), || mgr.invocation_count() >= 1).await);

    mock.put(CONFIG_KEY, b"autostart: false");
    assert!(
        wait_until(Duration::from_secs(5), || !slot.autostart_enabled()).await,
        "the watcher should pick the update up promptly"
    );

    // At most one already-in-flight tick may still actuate; after that the
    // agent stays passive.
    time::sleep(Duration::from_secs(12)).await;
    let settled = mgr.invocation_count();
    time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        mgr.invocation_count(),
        settled,
        "no actuation may happen once autostart is off"
    );
    assert!(mock.is_locked(LOCK_KEY), "the leadership is kept while passive");

    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), async {
        let _ = watcher_handle.await;
        let _ = driver_handle.await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_session_expiry_triggers_reelection() {
    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::succeeding();

    let first = service_driver(&mock, &mgr, RuntimeSlot::new());
    let first_id = first.agent_id().to_string();
    let (first_tx, _) = broadcast::channel(1);
    let first_handle = tokio::spawn(first.run(first_tx.subscribe()));

    assert!(wait_until(Duration::from_secs(5), || mock.is_locked(LOCK_KEY)).await);
    assert_eq!(mock.holder(LOCK_KEY).unwrap().0, first_id);

    let second = service_driver(&mock, &mgr, RuntimeSlot::new());
    let second_id = second.agent_id().to_string();
    let (second_tx, _) = broadcast::channel(1);
    let second_handle = tokio::spawn(second.run(second_tx.subscribe()));

    // The second agent queues behind the first.
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mock.holder(LOCK_KEY).unwrap().0, first_id);

    // Kill the lease: the loser of the expiry re-enters the election, so
    // the lock must be re-bound to exactly one of the two agents.
    mock.expire_lock(LOCK_KEY);
    assert!(wait_until(Duration::from_secs(10), || mock.is_locked(LOCK_KEY)).await);
    let holder = mock.holder(LOCK_KEY).unwrap().0;
    assert!(holder == first_id || holder == second_id);

    // Retire the first agent entirely; the second must end up leading.
    first_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(15), first_handle)
        .await
        .expect("first driver should stop")
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(15), || {
            mock.holder(LOCK_KEY).is_some_and(|(v, s)| v == second_id && s.is_some())
        })
        .await,
        "the surviving agent should take the leadership over"
    );

    second_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), second_handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!mock.is_locked(LOCK_KEY));
}

#[tokio::test]
async fn test_shutdown_releases_every_held_lock() {
    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::succeeding();
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handles = Vec::new();
    let mut lock_keys = Vec::new();

    for index in 0..3 {
        let name = format!("lustre0-OST{index:04x}");
        lock_keys.push(format!("lustra/services/{name}/lock"));
        let coordinator: Arc<dyn Coordinator> = Arc::new(mock.clone());
        let driver = AgentDriver::new(
            ServiceCharge::new(&name),
            coordinator,
            MgrCommand::new(mgr.program()),
            RuntimeSlot::new(),
        );
        handles.push(tokio::spawn(driver.run(shutdown_tx.subscribe())));
    }

    for key in &lock_keys {
        let key = key.clone();
        let mock = mock.clone();
        assert!(wait_until(Duration::from_secs(5), move || mock.is_locked(&key)).await);
    }

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        time::timeout(Duration::from_secs(15), handle)
            .await
            .expect("driver should drain within the TTL bound")
            .unwrap();
    }
    for key in &lock_keys {
        assert!(!mock.is_locked(key), "lock '{key}' should be released");
    }
}

#[tokio::test]
async fn test_no_actuation_without_leadership() {
    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::succeeding();
    let slot = RuntimeSlot::new();
    slot.publish(RuntimeConfig { autostart: true });

    // An outside party holds the lock first.
    let (dummy_tx, mut dummy_rx) = broadcast::channel(1);
    let intruder = mock
        .lock(LOCK_KEY, "intruder", &mut dummy_rx)
        .await
        .expect("test lock should acquire");

    let driver = service_driver(&mock, &mgr, slot);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    // Two supervisory ticks worth of waiting: a non-leader never actuates,
    // autostart or not.
    time::sleep(Duration::from_secs(12)).await;
    assert_eq!(mgr.invocation_count(), 0);

    intruder.release().await;
    assert!(wait_until(Duration::from_secs(10), || mgr.invocation_count() >= 1).await);

    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    drop(dummy_tx);
}

#[tokio::test(flavor = "current_thread")]
async fn test_already_mounted_marker_suppresses_stale_status_log() {
    let capture = LogCapture::new();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mock = MemoryCoordinator::new();
    let mgr = FakeMgr::new(r#"echo "already mounted"; exit 0"#);
    let slot = RuntimeSlot::new();
    slot.publish(RuntimeConfig { autostart: true });

    let driver = service_driver(&mock, &mgr, slot);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    assert!(wait_until(Duration::from_secs(25), || mgr.invocation_count() >= 2).await);
    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        capture.occurrences("re-actuated unexpectedly"),
        0,
        "the already-mounted marker must suppress the stale-status record"
    );
    assert_eq!(capture.occurrences("Status of service"), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn test_unexpected_remount_logs_stale_status() {
    let capture = LogCapture::new();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mock = MemoryCoordinator::new();
    // Succeeds without the marker: looks like a fresh mount every time.
    let mgr = FakeMgr::new(r#"echo "mounted cleanly"; exit 0"#);
    let slot = RuntimeSlot::new();
    slot.publish(RuntimeConfig { autostart: true });

    let driver = service_driver(&mock, &mgr, slot);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    assert!(wait_until(Duration::from_secs(25), || mgr.invocation_count() >= 2).await);
    shutdown_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(
        capture.occurrences("re-actuated unexpectedly") >= 1,
        "a repeat success without the marker must raise the stale-status record"
    );
}
